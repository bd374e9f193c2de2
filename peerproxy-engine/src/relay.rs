//! Byte relay between local sockets and the social channel.
//!
//! Every SOCKS connection is one *stream* inside a session. The getter end
//! opens it for each connection accepted on its endpoint; the sharer end
//! runs the SOCKS5 handshake against the relayed bytes, dials the target
//! and pumps both ways. Each stream is its own task and ends with a
//! [`StreamExit`]; only a failure of the social channel is fatal to the
//! session.

use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use peerproxy_core::channel::SocialChannel;
use peerproxy_core::contact::PeerRef;
use peerproxy_core::protocol::{MAX_STREAM_CHUNK, Signal};
use peerproxy_core::socks::{self, Reply, SocksRequest};
use peerproxy_core::transport::{Connection, Connector};

const READ_BUF_LEN: usize = 16 * 1024;

/// How a stream task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamExit {
    pub stream_id: u64,
    /// Set when the social channel failed; the session cannot continue.
    pub channel_error: Option<String>,
}

/// Sends the frames of one stream to the peer.
pub struct StreamLink<C> {
    channel: Arc<C>,
    peer: PeerRef,
    token: Uuid,
    stream_id: u64,
}

impl<C: SocialChannel> StreamLink<C> {
    pub fn new(channel: Arc<C>, peer: PeerRef, token: Uuid, stream_id: u64) -> Self {
        Self {
            channel,
            peer,
            token,
            stream_id,
        }
    }

    async fn send(&self, signal: Signal) -> anyhow::Result<()> {
        let payload = signal.encode()?;
        self.channel
            .send(&self.peer, payload)
            .await
            .with_context(|| format!("failed to relay stream {} to {}", self.stream_id, self.peer))
    }

    async fn open(&self) -> anyhow::Result<()> {
        self.send(Signal::StreamOpen {
            token: self.token,
            stream_id: self.stream_id,
        })
        .await
    }

    async fn data(&self, bytes: &[u8]) -> anyhow::Result<()> {
        for chunk in bytes.chunks(MAX_STREAM_CHUNK) {
            self.send(Signal::StreamData {
                token: self.token,
                stream_id: self.stream_id,
                data: Bytes::copy_from_slice(chunk),
            })
            .await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.send(Signal::StreamClose {
            token: self.token,
            stream_id: self.stream_id,
        })
        .await
    }

    fn exit(&self, channel_error: Option<&anyhow::Error>) -> StreamExit {
        StreamExit {
            stream_id: self.stream_id,
            channel_error: channel_error.map(|e| format!("{e:#}")),
        }
    }
}

/// Getter end: announces the stream, then relays the accepted connection.
pub async fn run_getter_stream<C, S>(
    conn: S,
    link: StreamLink<C>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
) -> StreamExit
where
    C: SocialChannel,
    S: Connection,
{
    debug!(stream_id = link.stream_id, client = %conn.peer(), "Opening stream");
    if let Err(e) = link.open().await {
        return link.exit(Some(&e));
    }
    pump(conn, &link, inbound).await
}

/// Sharer end: answers the SOCKS5 handshake, dials the requested target
/// and relays.
pub async fn run_sharer_stream<C, K>(
    connector: Arc<K>,
    link: StreamLink<C>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
) -> StreamExit
where
    C: SocialChannel,
    K: Connector,
{
    let mut buf = BytesMut::new();

    let no_auth = match read_until(&mut inbound, &mut buf, socks::try_parse_greeting).await {
        Ok(Some(no_auth)) => no_auth,
        Ok(None) => return link.exit(None),
        Err(e) => {
            debug!(stream_id = link.stream_id, error = %e, "Bad SOCKS greeting");
            return close_quietly(&link).await;
        }
    };
    if let Err(e) = link.data(&socks::method_selection(no_auth)).await {
        return link.exit(Some(&e));
    }
    if !no_auth {
        return close_quietly(&link).await;
    }

    let target = match read_until(&mut inbound, &mut buf, socks::try_parse_request).await {
        Ok(Some(SocksRequest::Connect(target))) => target,
        Ok(Some(SocksRequest::Unsupported(code))) => return refuse(&link, code).await,
        Ok(None) => return link.exit(None),
        Err(e) => {
            debug!(stream_id = link.stream_id, error = %e, "Bad SOCKS request");
            return close_quietly(&link).await;
        }
    };

    debug!(stream_id = link.stream_id, target = %target, "Dialing for peer");
    let mut conn = match connector.connect(&target.host(), target.port()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(stream_id = link.stream_id, target = %target, error = %e, "Dial failed");
            return refuse(&link, socks::reply_for_error(&e)).await;
        }
    };

    let bound = conn.peer().parse().ok();
    if let Err(e) = link.data(&socks::reply(Reply::Succeeded, bound)).await {
        return link.exit(Some(&e));
    }
    if !buf.is_empty() && conn.write_all(&buf).await.is_err() {
        return close_quietly(&link).await;
    }
    pump(conn, &link, inbound).await
}

/// Feeds relayed bytes into `buf` until `parse` yields a value. `Ok(None)`
/// means the getter closed the stream first.
async fn read_until<T>(
    inbound: &mut mpsc::UnboundedReceiver<Bytes>,
    buf: &mut BytesMut,
    parse: fn(&mut BytesMut) -> anyhow::Result<Option<T>>,
) -> anyhow::Result<Option<T>> {
    loop {
        if let Some(value) = parse(buf)? {
            return Ok(Some(value));
        }
        match inbound.recv().await {
            Some(bytes) => buf.extend_from_slice(&bytes),
            None => return Ok(None),
        }
    }
}

async fn refuse<C: SocialChannel>(link: &StreamLink<C>, code: Reply) -> StreamExit {
    if let Err(e) = link.data(&socks::reply(code, None)).await {
        return link.exit(Some(&e));
    }
    close_quietly(link).await
}

async fn close_quietly<C: SocialChannel>(link: &StreamLink<C>) -> StreamExit {
    match link.close().await {
        Ok(()) => link.exit(None),
        Err(e) => link.exit(Some(&e)),
    }
}

/// Relays in both directions with half-close: local EOF sends
/// `StreamClose`, a closed `inbound` shuts down the local write half, and
/// the task ends once both directions are done.
async fn pump<C, S>(
    mut conn: S,
    link: &StreamLink<C>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
) -> StreamExit
where
    C: SocialChannel,
    S: Connection,
{
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut reading = true;
    let mut writing = true;

    while reading || writing {
        tokio::select! {
            res = conn.read(&mut buf), if reading => match res {
                Ok(0) => {
                    trace!(stream_id = link.stream_id, "Local end finished sending");
                    reading = false;
                    if let Err(e) = link.close().await {
                        return link.exit(Some(&e));
                    }
                }
                Ok(n) => {
                    if let Err(e) = link.data(&buf[..n]).await {
                        return link.exit(Some(&e));
                    }
                }
                Err(e) => {
                    debug!(stream_id = link.stream_id, error = %e, "Local read failed, closing stream");
                    return close_quietly(link).await;
                }
            },

            data = inbound.recv(), if writing => match data {
                Some(bytes) => {
                    if let Err(e) = conn.write_all(&bytes).await {
                        debug!(stream_id = link.stream_id, error = %e, "Local write failed, closing stream");
                        return if reading { close_quietly(link).await } else { link.exit(None) };
                    }
                }
                None => {
                    trace!(stream_id = link.stream_id, "Peer finished sending");
                    writing = false;
                    let _ = conn.shutdown().await;
                }
            },
        }
    }

    debug!(stream_id = link.stream_id, "Stream closed");
    link.exit(None)
}
