use anyhow::{Context, Result, bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consent::RemoteConsent;
use crate::contact::Role;

/// ASCII magic bytes that open every peerproxy frame.
const MAGIC: &[u8; 5] = b"PPRXY";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
/// Token(16) + stream id(8) prefix of a binary stream-data payload.
const STREAM_DATA_PREFIX: usize = 24;
/// Largest chunk of relayed bytes that fits in one stream-data frame.
pub const MAX_STREAM_CHUNK: usize = MAX_PAYLOAD_LEN - STREAM_DATA_PREFIX;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    ConsentUpdate = 0x10,
    SessionRequest = 0x20,
    SessionAccept = 0x21,
    SessionReject = 0x22,
    SessionClose = 0x23,
    StreamOpen = 0x30,
    StreamData = 0x31,
    StreamClose = 0x32,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::ConsentUpdate),
            0x20 => Ok(Self::SessionRequest),
            0x21 => Ok(Self::SessionAccept),
            0x22 => Ok(Self::SessionReject),
            0x23 => Ok(Self::SessionClose),
            0x30 => Ok(Self::StreamOpen),
            0x31 => Ok(Self::StreamData),
            0x32 => Ok(Self::StreamClose),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags, always `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))`: a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.
/// * `Err(..)`: protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload). The caller should drop the link.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected PPRXY"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]);
    let payload_len = u32::from_be_bytes([
        buf[OFF_LENGTH],
        buf[OFF_LENGTH + 1],
        buf[OFF_LENGTH + 2],
        buf[OFF_LENGTH + 3],
    ]) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).freeze();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::Hello`] and [`MessageType::HelloAck`] on a
/// direct link: who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub network: String,
    pub user_id: String,
    pub instance_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequestPayload {
    pub token: Uuid,
    /// Role the *sender* will play.
    pub initiator_role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAcceptPayload {
    pub token: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRejectPayload {
    pub token: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosePayload {
    pub token: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for [`MessageType::StreamOpen`] and [`MessageType::StreamClose`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub token: Uuid,
    pub stream_id: u64,
}

/// Payload for [`MessageType::Error`] (either direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ── Typed messages ──────────────────────────────────────────────────

/// A decoded message exchanged between two instances over the social channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Hello(HelloPayload),
    HelloAck(HelloPayload),
    ConsentUpdate(RemoteConsent),
    SessionRequest {
        token: Uuid,
        initiator_role: Role,
    },
    SessionAccept {
        token: Uuid,
    },
    SessionReject {
        token: Uuid,
        reason: String,
    },
    SessionClose {
        token: Uuid,
        reason: Option<String>,
    },
    StreamOpen {
        token: Uuid,
        stream_id: u64,
    },
    StreamData {
        token: Uuid,
        stream_id: u64,
        data: Bytes,
    },
    StreamClose {
        token: Uuid,
        stream_id: u64,
    },
    Error(ErrorPayload),
}

impl Signal {
    /// The session token this message belongs to, if any.
    pub fn token(&self) -> Option<Uuid> {
        match self {
            Self::SessionRequest { token, .. }
            | Self::SessionAccept { token }
            | Self::SessionReject { token, .. }
            | Self::SessionClose { token, .. }
            | Self::StreamOpen { token, .. }
            | Self::StreamData { token, .. }
            | Self::StreamClose { token, .. } => Some(*token),
            Self::Hello(_) | Self::HelloAck(_) | Self::ConsentUpdate(_) | Self::Error(_) => None,
        }
    }

    /// Encodes this message as one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails or the stream data does
    /// not fit in one frame.
    pub fn encode(&self) -> Result<Bytes> {
        let frame = match self {
            Self::Hello(p) => json_frame(MessageType::Hello, p)?,
            Self::HelloAck(p) => json_frame(MessageType::HelloAck, p)?,
            Self::ConsentUpdate(p) => json_frame(MessageType::ConsentUpdate, p)?,
            Self::SessionRequest {
                token,
                initiator_role,
            } => json_frame(
                MessageType::SessionRequest,
                &SessionRequestPayload {
                    token: *token,
                    initiator_role: *initiator_role,
                },
            )?,
            Self::SessionAccept { token } => json_frame(
                MessageType::SessionAccept,
                &SessionAcceptPayload { token: *token },
            )?,
            Self::SessionReject { token, reason } => json_frame(
                MessageType::SessionReject,
                &SessionRejectPayload {
                    token: *token,
                    reason: reason.clone(),
                },
            )?,
            Self::SessionClose { token, reason } => json_frame(
                MessageType::SessionClose,
                &SessionClosePayload {
                    token: *token,
                    reason: reason.clone(),
                },
            )?,
            Self::StreamOpen { token, stream_id } => json_frame(
                MessageType::StreamOpen,
                &StreamPayload {
                    token: *token,
                    stream_id: *stream_id,
                },
            )?,
            Self::StreamData {
                token,
                stream_id,
                data,
            } => {
                ensure!(
                    data.len() <= MAX_STREAM_CHUNK,
                    "stream chunk too large: {} bytes (max {MAX_STREAM_CHUNK})",
                    data.len()
                );
                let mut payload = BytesMut::with_capacity(STREAM_DATA_PREFIX + data.len());
                payload.put_slice(token.as_bytes());
                payload.put_u64(*stream_id);
                payload.put_slice(data);
                encode_frame_to_bytes(MessageType::StreamData, &payload)
            }
            Self::StreamClose { token, stream_id } => json_frame(
                MessageType::StreamClose,
                &StreamPayload {
                    token: *token,
                    stream_id: *stream_id,
                },
            )?,
            Self::Error(p) => json_frame(MessageType::Error, p)?,
        };
        Ok(frame.freeze())
    }

    /// Decodes a frame produced by [`Signal::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the frame type.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let payload = &frame.payload;
        let signal = match frame.header.msg_type {
            MessageType::Hello => Self::Hello(decode_payload(payload)?),
            MessageType::HelloAck => Self::HelloAck(decode_payload(payload)?),
            MessageType::ConsentUpdate => Self::ConsentUpdate(decode_payload(payload)?),
            MessageType::SessionRequest => {
                let p: SessionRequestPayload = decode_payload(payload)?;
                Self::SessionRequest {
                    token: p.token,
                    initiator_role: p.initiator_role,
                }
            }
            MessageType::SessionAccept => {
                let p: SessionAcceptPayload = decode_payload(payload)?;
                Self::SessionAccept { token: p.token }
            }
            MessageType::SessionReject => {
                let p: SessionRejectPayload = decode_payload(payload)?;
                Self::SessionReject {
                    token: p.token,
                    reason: p.reason,
                }
            }
            MessageType::SessionClose => {
                let p: SessionClosePayload = decode_payload(payload)?;
                Self::SessionClose {
                    token: p.token,
                    reason: p.reason,
                }
            }
            MessageType::StreamOpen => {
                let p: StreamPayload = decode_payload(payload)?;
                Self::StreamOpen {
                    token: p.token,
                    stream_id: p.stream_id,
                }
            }
            MessageType::StreamData => {
                ensure!(
                    payload.len() >= STREAM_DATA_PREFIX,
                    "stream data payload too short: {} bytes",
                    payload.len()
                );
                let mut data = payload.clone();
                let token = Uuid::from_slice(&data.split_to(16)).context("invalid session token")?;
                let stream_id = data.get_u64();
                Self::StreamData {
                    token,
                    stream_id,
                    data,
                }
            }
            MessageType::StreamClose => {
                let p: StreamPayload = decode_payload(payload)?;
                Self::StreamClose {
                    token: p.token,
                    stream_id: p.stream_id,
                }
            }
            MessageType::Error => Self::Error(decode_payload(payload)?),
        };
        Ok(signal)
    }

    /// Decodes a complete channel payload holding exactly one frame.
    ///
    /// # Errors
    ///
    /// Returns an error on protocol violations, truncated frames or
    /// trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(bytes);
        let frame = try_decode_frame(&mut buf)?.context("truncated frame")?;
        ensure!(buf.is_empty(), "{} trailing bytes after frame", buf.len());
        Self::decode(&frame)
    }
}

fn json_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}
