//! # peerproxy-engine
//!
//! Runtime logic for peerproxy, embedded into the CLI and UI adapters.
//!
//! This crate provides:
//! - **Engine** and its [`CoreConnector`](engine::CoreConnector) handle: the
//!   single loop that owns consent state, contacts and sessions
//! - **Session actors**: one task per proxy session, driving the signaling
//!   handshake, the SOCKS endpoint and the VPN binding
//! - **Stream relay** between local sockets and the social channel
//! - **Social network adapters**: in-process loopback and direct TCP links
//! - **Event bus**: consent, session and VPN events for CLI loggers or UI
//!   subscribers

pub mod direct;
pub mod engine;
pub mod manager;
pub mod memory;
pub mod relay;
pub mod session;
pub mod tcp;
pub mod vpn;

#[cfg(test)]
mod testing;
