//! SOCKS5 server-side parsing (RFC 1928), no authentication, CONNECT only.
//!
//! The sharer end of a stream runs this handshake against the bytes its
//! getter relays. Parsers follow the frame codec convention: `Ok(None)`
//! means "need more bytes" and leaves the buffer untouched.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, BytesMut};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent back to the SOCKS client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination requested by a CONNECT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Outcome of parsing the request that follows the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksRequest {
    Connect(TargetAddr),
    /// A well-formed request the server refuses; send this reply and close.
    Unsupported(Reply),
}

/// Parses the client greeting and returns whether the no-auth method was
/// offered.
///
/// # Errors
///
/// Returns an error if the client does not speak SOCKS5.
pub fn try_parse_greeting(buf: &mut BytesMut) -> Result<Option<bool>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    ensure!(buf[0] == VERSION, "not SOCKS5: version 0x{:02X}", buf[0]);
    let n_methods = usize::from(buf[1]);
    if buf.len() < 2 + n_methods {
        return Ok(None);
    }
    buf.advance(2);
    let methods = buf.split_to(n_methods);
    Ok(Some(methods.contains(&METHOD_NO_AUTH)))
}

/// The server's method selection message.
#[must_use]
pub fn method_selection(no_auth_offered: bool) -> [u8; 2] {
    if no_auth_offered {
        [VERSION, METHOD_NO_AUTH]
    } else {
        [VERSION, METHOD_NONE_ACCEPTABLE]
    }
}

/// Parses a request message.
///
/// # Errors
///
/// Returns an error on a wrong version byte or an undecodable domain name.
pub fn try_parse_request(buf: &mut BytesMut) -> Result<Option<SocksRequest>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    ensure!(buf[0] == VERSION, "not SOCKS5: version 0x{:02X}", buf[0]);
    let cmd = buf[1];
    let atyp = buf[3];

    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return Ok(None);
            }
            1 + usize::from(buf[4])
        }
        _ => {
            buf.clear();
            return Ok(Some(SocksRequest::Unsupported(
                Reply::AddressTypeNotSupported,
            )));
        }
    };
    let total = 4 + addr_len + 2;
    if buf.len() < total {
        return Ok(None);
    }

    let mut msg = buf.split_to(total);
    msg.advance(4);
    if cmd != CMD_CONNECT {
        return Ok(Some(SocksRequest::Unsupported(Reply::CommandNotSupported)));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let ip = Ipv4Addr::from(msg.get_u32());
            TargetAddr::Ip(SocketAddr::new(ip.into(), msg.get_u16()))
        }
        ATYP_IPV6 => {
            let ip = Ipv6Addr::from(msg.get_u128());
            TargetAddr::Ip(SocketAddr::new(ip.into(), msg.get_u16()))
        }
        _ => {
            let len = usize::from(msg.get_u8());
            let host = String::from_utf8(msg.split_to(len).to_vec())?;
            TargetAddr::Domain(host, msg.get_u16())
        }
    };
    Ok(Some(SocksRequest::Connect(target)))
}

/// Builds a reply message. `bound` defaults to `0.0.0.0:0`.
#[must_use]
pub fn reply(code: Reply, bound: Option<SocketAddr>) -> BytesMut {
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(VERSION);
    buf.put_u8(code as u8);
    buf.put_u8(0x00);
    match bound {
        SocketAddr::V4(v4) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
        }
    }
    buf.put_u16(bound.port());
    buf
}

/// Maps a dial failure onto the closest reply code.
pub fn reply_for_error(err: &anyhow::Error) -> Reply {
    let Some(io) = err.downcast_ref::<std::io::Error>() else {
        return Reply::HostUnreachable;
    };
    match io.kind() {
        std::io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
        std::io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
        _ => Reply::HostUnreachable,
    }
}
