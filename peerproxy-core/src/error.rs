//! Error taxonomy shared by the consent layer and the session engine.
//!
//! Every variant is recoverable: the engine reports it to the UI boundary
//! attributed to a contact or session and keeps running.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consent::ConsentAction;
use crate::contact::Role;
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// A consent action whose precondition does not hold. State is unchanged.
    #[error("invalid consent transition {action}: {reason}")]
    InvalidTransition {
        action: ConsentAction,
        reason: &'static str,
    },

    /// A start/stop arrived while another one is still pending.
    #[error("session {session_id} is busy with a pending operation")]
    SessionBusy { session_id: u64 },

    #[error("consent to act as {role} is not mutual")]
    ConsentNotMutual { role: Role },

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("peer unreachable")]
    PeerUnreachable,

    /// The VPN device is bound to a different session.
    #[error("VPN device is bound to session {session_id}")]
    DeviceBusy { session_id: u64 },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("cannot {op} a session in state {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("unknown contact {0}")]
    UnknownContact(String),

    #[error("no connected getter session provides a proxy endpoint")]
    NoProxyEndpoint,

    #[error("VPN device error: {0}")]
    Device(String),

    #[error("engine stopped")]
    EngineStopped,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::SessionBusy { .. } => ErrorKind::SessionBusy,
            Self::ConsentNotMutual { .. } => ErrorKind::ConsentNotMutual,
            Self::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Self::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            Self::PeerUnreachable => ErrorKind::PeerUnreachable,
            Self::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Self::TransportError(_) => ErrorKind::TransportError,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::UnknownContact(_) => ErrorKind::UnknownContact,
            Self::NoProxyEndpoint => ErrorKind::NoProxyEndpoint,
            Self::Device(_) => ErrorKind::Device,
            Self::EngineStopped => ErrorKind::EngineStopped,
        }
    }

    /// Wraps a collaborator failure (channel, listener, dialer) as a
    /// data-path error, keeping the whole context chain.
    pub fn transport(err: &anyhow::Error) -> Self {
        Self::TransportError(format!("{err:#}"))
    }
}

/// Serializable discriminant of [`ProxyError`] for the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidTransition,
    SessionBusy,
    ConsentNotMutual,
    HandshakeTimeout,
    HandshakeRejected,
    PeerUnreachable,
    DeviceBusy,
    TransportError,
    InvalidState,
    UnknownContact,
    NoProxyEndpoint,
    Device,
    EngineStopped,
}

/// Result type alias for consent and session operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::UserAction;

    #[test]
    fn test_invalid_transition_display_names_action() {
        let err = ProxyError::InvalidTransition {
            action: ConsentAction::User(UserAction::CancelRequest),
            reason: "access was not requested",
        };
        let msg = err.to_string();
        assert!(msg.contains("CANCEL_REQUEST"));
        assert!(msg.contains("not requested"));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn test_transport_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("connection reset").context("failed to send frame");
        let err = ProxyError::transport(&inner);
        assert_eq!(
            err.to_string(),
            "transport error: failed to send frame: connection reset"
        );
    }

    #[test]
    fn test_error_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::PeerUnreachable).unwrap();
        assert_eq!(json, "\"PEER_UNREACHABLE\"");
    }
}
