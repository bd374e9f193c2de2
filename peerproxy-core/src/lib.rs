//! # peerproxy-core
//!
//! Shared building blocks for peerproxy, where two mutually consenting peers
//! use one another's network connection as a proxy.
//!
//! This crate provides the foundational types used by [`peerproxy-engine`]
//! and the `peerproxy-cli` binary.
//!
//! ## Responsibilities
//!
//! - **Consent model**: the per-contact four-way consent state, its legal
//!   transitions, the [`store::ConsentStore`] that owns it and the
//!   [`negotiation::ConsentStateMachine`] that detects mutual consent.
//!
//! - **Protocol primitives**: frame format (magic / version / type / length)
//!   for signaling over a social channel, typed messages and the SOCKS5
//!   server handshake used on the sharer side.
//!
//! - **Collaborator seams**: traits for the social channel, the VPN device
//!   and the local sockets, so the engine runs unchanged over real networks
//!   and in-memory fakes.

pub mod channel;
pub mod consent;
pub mod contact;
pub mod error;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod socks;
pub mod store;
pub mod transport;
