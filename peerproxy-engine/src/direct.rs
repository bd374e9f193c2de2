//! Social channel over direct links between instances.
//!
//! Each link is one transport connection. The dialing side sends `Hello`,
//! the accepting side answers `HelloAck`; both carry the sender's network,
//! user and instance. Afterwards every frame on the link is handed to the
//! engine as a [`NetworkEvent::Message`]. A user is online while at least
//! one link to one of its instances is up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use peerproxy_core::channel::{NetworkEvent, SocialChannel};
use peerproxy_core::contact::{Contact, LocalIdentity, PeerRef, Presence};
use peerproxy_core::protocol::{
    ErrorPayload, Frame, HelloPayload, MessageType, Signal, encode_frame_to_bytes,
    try_decode_frame,
};
use peerproxy_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// How long either side waits for the other's greeting.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 16 * 1024;

struct Link {
    id: u64,
    display_name: String,
    outbound: mpsc::UnboundedSender<Bytes>,
}

struct Shared {
    identity: LocalIdentity,
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
    /// Keyed by remote (user id, instance id).
    links: Mutex<HashMap<(String, String), Link>>,
    next_link_id: AtomicU64,
}

/// Handle on the direct links of one local instance. Cheap to clone.
#[derive(Clone)]
pub struct DirectChannel {
    shared: Arc<Shared>,
}

impl DirectChannel {
    pub fn new(identity: LocalIdentity, network_tx: mpsc::UnboundedSender<NetworkEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                network_tx,
                links: Mutex::new(HashMap::new()),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    /// Binds `addr` and accepts links in the background. Returns the bound
    /// address.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn listen<F: ListenerFactory>(&self, factory: &F, addr: &str) -> anyhow::Result<String> {
        let mut listener = factory.bind(addr).await?;
        let local_addr = listener.local_addr();
        info!(addr = %local_addr, "Accepting direct links");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let conn = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Direct link listener stopped");
                        break;
                    }
                };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let peer = conn.peer();
                    if let Err(e) = accept_link(shared, conn).await {
                        warn!(peer = %peer, error = %e, "Inbound link failed");
                    }
                });
            }
        });
        Ok(local_addr)
    }

    /// Dials `host:port` and completes the greeting. Returns the address of
    /// the remote instance; the link keeps running in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial or the greeting fails.
    pub async fn connect<K: Connector>(
        &self,
        connector: &K,
        host: &str,
        port: u16,
    ) -> anyhow::Result<PeerRef> {
        let mut conn = connector.connect(host, port).await?;
        let mut buf = BytesMut::new();

        let hello = Signal::Hello(hello_of(&self.shared.identity)).encode()?;
        conn.write_all(&hello).await?;

        let remote = match tokio::time::timeout(HELLO_TIMEOUT, read_signal(&mut conn, &mut buf))
            .await
            .context("timed out waiting for HelloAck")??
        {
            Signal::HelloAck(remote) => remote,
            Signal::Error(ErrorPayload { code, message }) => {
                bail!("peer refused link ({code}): {message}");
            }
            other => bail!("expected HelloAck, got {other:?}"),
        };
        check_remote(&self.shared.identity, &remote)?;

        let peer = PeerRef::new(
            self.shared.identity.contact(&remote.user_id),
            &remote.instance_id,
        );
        let registered = register(&self.shared, &remote);
        tokio::spawn(run_link(Arc::clone(&self.shared), conn, remote, buf, registered));
        Ok(peer)
    }
}

impl SocialChannel for DirectChannel {
    fn send<'a>(
        &'a self,
        to: &'a PeerRef,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            let links = self.shared.lock();
            let key = (to.contact.user_id.clone(), to.instance_id.clone());
            let Some(link) = links.get(&key) else {
                bail!("no direct link to {to}");
            };
            link.outbound
                .send(payload)
                .map_err(|_| anyhow::anyhow!("direct link to {to} is closing"))
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports how the local instance now sees `user_id`.
    fn publish_presence(&self, user_id: &str) {
        let links = self.lock();
        let mut instance_ids: Vec<String> = Vec::new();
        let mut display_name = user_id.to_string();
        for ((user, instance), link) in links.iter() {
            if user == user_id {
                instance_ids.push(instance.clone());
                display_name.clone_from(&link.display_name);
            }
        }
        instance_ids.sort();
        let contact = Contact {
            id: self.identity.contact(user_id),
            display_name,
            presence: if instance_ids.is_empty() {
                Presence::Offline
            } else {
                Presence::Online
            },
            instance_ids,
        };
        let _ = self.network_tx.send(NetworkEvent::Presence(contact));
    }
}

fn hello_of(identity: &LocalIdentity) -> HelloPayload {
    HelloPayload {
        network: identity.network.clone(),
        user_id: identity.user_id.clone(),
        instance_id: identity.instance_id.clone(),
        display_name: identity.display_name.clone(),
    }
}

fn check_remote(local: &LocalIdentity, remote: &HelloPayload) -> anyhow::Result<()> {
    ensure!(
        remote.network == local.network,
        "network mismatch: local {}, remote {}",
        local.network,
        remote.network
    );
    ensure!(
        remote.user_id != local.user_id,
        "refusing link to own user {}",
        remote.user_id
    );
    Ok(())
}

/// Reads until one complete frame is buffered and decodes it.
async fn read_signal<C: Connection>(conn: &mut C, buf: &mut BytesMut) -> anyhow::Result<Signal> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Some(frame) = try_decode_frame(buf)? {
            return Signal::decode(&frame);
        }
        let n = conn.read(&mut chunk).await?;
        ensure!(n > 0, "link closed during greeting");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn accept_link<C: Connection>(shared: Arc<Shared>, mut conn: C) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    let remote = match tokio::time::timeout(HELLO_TIMEOUT, read_signal(&mut conn, &mut buf))
        .await
        .context("timed out waiting for Hello")??
    {
        Signal::Hello(remote) => remote,
        other => bail!("expected Hello, got {other:?}"),
    };

    if let Err(e) = check_remote(&shared.identity, &remote) {
        let refusal = Signal::Error(ErrorPayload {
            code: "link_refused".into(),
            message: e.to_string(),
        });
        if let Ok(frame) = refusal.encode() {
            let _ = conn.write_all(&frame).await;
        }
        let _ = conn.shutdown().await;
        return Err(e);
    }

    let ack = Signal::HelloAck(hello_of(&shared.identity)).encode()?;
    conn.write_all(&ack).await?;
    let registered = register(&shared, &remote);
    run_link(shared, conn, remote, buf, registered).await;
    Ok(())
}

/// Makes the link to `remote` the route for sends to that instance,
/// replacing any older link.
fn register(shared: &Shared, remote: &HelloPayload) -> (u64, mpsc::UnboundedReceiver<Bytes>) {
    let id = shared.next_link_id.fetch_add(1, Ordering::Relaxed);
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    shared.lock().insert(
        (remote.user_id.clone(), remote.instance_id.clone()),
        Link {
            id,
            display_name: remote.display_name.clone(),
            outbound,
        },
    );
    info!(user = %remote.user_id, instance = %remote.instance_id, link_id = id, "Direct link up");
    shared.publish_presence(&remote.user_id);
    (id, outbound_rx)
}

/// Owns one established link until either side closes it.
async fn run_link<C: Connection>(
    shared: Arc<Shared>,
    mut conn: C,
    remote: HelloPayload,
    mut buf: BytesMut,
    (id, mut outbound_rx): (u64, mpsc::UnboundedReceiver<Bytes>),
) {
    let key = (remote.user_id.clone(), remote.instance_id.clone());
    let from = PeerRef::new(shared.identity.contact(&remote.user_id), &remote.instance_id);

    let result = pump_link(&shared, &mut conn, &from, &mut buf, &mut outbound_rx).await;
    match result {
        Ok(()) => info!(peer = %from, link_id = id, "Direct link closed"),
        Err(e) => warn!(peer = %from, link_id = id, error = %e, "Direct link failed"),
    }
    let _ = conn.shutdown().await;

    let removed = {
        let mut links = shared.lock();
        if links.get(&key).is_some_and(|link| link.id == id) {
            links.remove(&key);
            true
        } else {
            false
        }
    };
    if removed {
        shared.publish_presence(&remote.user_id);
    }
}

async fn pump_link<C: Connection>(
    shared: &Shared,
    conn: &mut C,
    from: &PeerRef,
    buf: &mut BytesMut,
    outbound_rx: &mut mpsc::UnboundedReceiver<Bytes>,
) -> anyhow::Result<()> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        while let Some(frame) = try_decode_frame(buf)? {
            deliver(shared, from, &frame);
        }

        tokio::select! {
            out = outbound_rx.recv() => {
                let Some(payload) = out else {
                    return Ok(());
                };
                conn.write_all(&payload).await?;
            }
            n = conn.read(&mut chunk) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

fn deliver(shared: &Shared, from: &PeerRef, frame: &Frame) {
    if matches!(
        frame.header.msg_type,
        MessageType::Hello | MessageType::HelloAck
    ) {
        debug!(peer = %from, "Ignoring repeated greeting");
        return;
    }
    trace!(peer = %from, msg_type = ?frame.header.msg_type, len = frame.payload.len(), "Frame received");
    let payload = encode_frame_to_bytes(frame.header.msg_type, &frame.payload).freeze();
    let _ = shared.network_tx.send(NetworkEvent::Message {
        from: from.clone(),
        payload,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{TcpConnector, TcpListenerFactory};
    use crate::testing::port_of;
    use peerproxy_core::consent::RemoteConsent;
    use peerproxy_core::contact::ContactId;

    fn identity(network: &str, user: &str, instance: &str) -> LocalIdentity {
        LocalIdentity {
            network: network.into(),
            user_id: user.into(),
            instance_id: instance.into(),
            display_name: user.to_uppercase(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for network event")
            .expect("network channel closed")
    }

    #[tokio::test]
    async fn given_listening_instance_when_peer_connects_then_both_see_presence() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let alice = DirectChannel::new(identity("direct", "alice", "a1"), a_tx);
        let bob = DirectChannel::new(identity("direct", "bob", "b1"), b_tx);
        let addr = alice.listen(&TcpListenerFactory, "127.0.0.1:0").await.unwrap();

        let peer = bob
            .connect(&TcpConnector, "127.0.0.1", port_of(&addr))
            .await
            .unwrap();
        assert_eq!(peer, PeerRef::new(ContactId::new("direct", "bob", "alice"), "a1"));

        let NetworkEvent::Presence(seen_by_alice) = next_event(&mut a_rx).await else {
            panic!("expected presence");
        };
        assert_eq!(seen_by_alice.id, ContactId::new("direct", "alice", "bob"));
        assert_eq!(seen_by_alice.display_name, "BOB");
        assert_eq!(seen_by_alice.instance_ids, vec!["b1"]);

        let NetworkEvent::Presence(seen_by_bob) = next_event(&mut b_rx).await else {
            panic!("expected presence");
        };
        assert!(seen_by_bob.is_online());
    }

    #[tokio::test]
    async fn given_link_when_sending_frame_then_peer_receives_it() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let alice = DirectChannel::new(identity("direct", "alice", "a1"), a_tx);
        let bob = DirectChannel::new(identity("direct", "bob", "b1"), b_tx);
        let addr = alice.listen(&TcpListenerFactory, "127.0.0.1:0").await.unwrap();
        let to_alice = bob
            .connect(&TcpConnector, "127.0.0.1", port_of(&addr))
            .await
            .unwrap();
        next_event(&mut a_rx).await;

        let update = Signal::ConsentUpdate(RemoteConsent {
            requests_access: true,
            offers_access: false,
        });
        bob.send(&to_alice, update.encode().unwrap()).await.unwrap();

        let NetworkEvent::Message { from, payload } = next_event(&mut a_rx).await else {
            panic!("expected message");
        };
        assert_eq!(from, PeerRef::new(ContactId::new("direct", "alice", "bob"), "b1"));
        assert_eq!(Signal::from_bytes(&payload).unwrap(), update);
    }

    #[tokio::test]
    async fn given_other_network_when_connecting_then_link_refused() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let alice = DirectChannel::new(identity("direct", "alice", "a1"), a_tx);
        let bob = DirectChannel::new(identity("elsewhere", "bob", "b1"), b_tx);
        let addr = alice.listen(&TcpListenerFactory, "127.0.0.1:0").await.unwrap();

        let err = bob
            .connect(&TcpConnector, "127.0.0.1", port_of(&addr))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("network mismatch"), "{err:#}");
    }

    #[tokio::test]
    async fn when_sending_without_link_expect_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = DirectChannel::new(identity("direct", "alice", "a1"), tx);
        let to = PeerRef::new(ContactId::new("direct", "alice", "bob"), "b1");

        let err = alice.send(&to, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.to_string().contains("no direct link"));
    }
}
