use std::fmt;
use std::net::SocketAddr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one proxy session.
///
/// ```text
/// Idle -> Connecting -> Connected -> Disconnecting -> Idle
///             \              \
///              +-> Failed <---+        Failed --reset--> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl SessionState {
    /// Connecting or Connected: the session holds resources and counts
    /// towards the single-getter limit.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A bound local network endpoint (the SOCKS listener of a getter session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses a listener address such as `"127.0.0.1:1080"`.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not a socket address.
    pub fn from_addr(addr: &str) -> anyhow::Result<Self> {
        let parsed: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid endpoint address: {addr}"))?;
        Ok(Self {
            host: parsed.ip().to_string(),
            port: parsed.port(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
