use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use peerproxy_core::channel::{NetworkEvent, SocialChannel, VpnDevice};
use peerproxy_core::consent::{ConsentFlags, UserAction};
use peerproxy_core::contact::{Contact, ContactId, PeerRef, Role};
use peerproxy_core::error::{ErrorKind, ProxyError, Result};
use peerproxy_core::session::{Endpoint, SessionState};
use peerproxy_core::transport::{Connector, ListenerFactory};

use crate::manager::SessionManager;
use crate::session::Services;
use crate::vpn::VpnSlot;

// ── Engine commands (UI → engine) ───────────────────────────────────

/// Commands sent by the CLI / UI to control the engine.
#[derive(Debug)]
pub enum EngineCmd {
    /// Apply a local consent action to a contact.
    ModifyConsent { contact: ContactId, action: UserAction },
    /// Start a proxy session with a contact. A GETTER start ends any other
    /// active GETTER session first.
    StartSession { contact: ContactId, role: Role },
    /// Stop a connected session.
    StopSession { contact: ContactId, role: Role },
    /// Abort a session that is still connecting.
    CancelSession { contact: ContactId, role: Role },
    /// Route the VPN device through the connected GETTER session.
    StartVpn,
    StopVpn,
    /// Full state query, answered on `reply`.
    GetState { reply: oneshot::Sender<EngineSnapshot> },
    /// Gracefully shut down the entire engine.
    ShutDown,
}

// ── Engine events (engine → UI) ─────────────────────────────────────

/// Events emitted by the engine for the CLI / UI to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A contact appeared or its presence changed.
    ContactUpdated { contact: Contact },
    ContactRemoved { contact: ContactId },
    /// The consent flags of a contact changed.
    ConsentChanged { contact: ContactId, state: ConsentFlags },
    /// Consent for `role` became mutual; the UI may now offer the session.
    ConsentReached { contact: ContactId, role: Role },
    /// Consent for `role` is no longer mutual.
    ConsentWithdrawn { contact: ContactId, role: Role },
    SessionStateChanged {
        contact: ContactId,
        role: Role,
        session_id: u64,
        state: SessionState,
        /// The local SOCKS endpoint of a GETTER session.
        endpoint: Option<Endpoint>,
        reason: Option<ProxyError>,
    },
    VpnStarted { contact: ContactId, message: String },
    /// The VPN device was stopped; a failed stop still ends the binding.
    VpnStopped {
        contact: ContactId,
        result: std::result::Result<String, String>,
    },
    /// A non-fatal error occurred inside the engine.
    Error {
        contact: Option<ContactId>,
        kind: ErrorKind,
        message: String,
    },
}

/// Answer to [`EngineCmd::GetState`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub contacts: Vec<Contact>,
    pub consent: Vec<(ContactId, ConsentFlags)>,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: u64,
    pub peer: PeerRef,
    pub role: Role,
    pub state: SessionState,
    pub endpoint: Option<Endpoint>,
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`]. Lets the caller send commands,
/// feed network events and subscribe to engine events.
#[derive(Clone)]
pub struct CoreConnector {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub events_tx: broadcast::Sender<EngineEvent>,
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl CoreConnector {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Where the social network adapter delivers inbound events.
    pub fn network_sender(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.network_tx.clone()
    }

    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn send(&self, cmd: EngineCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ProxyError::EngineStopped)
    }

    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn modify_consent(&self, contact: ContactId, action: UserAction) -> Result<()> {
        self.send(EngineCmd::ModifyConsent { contact, action }).await
    }

    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn start_session(&self, contact: ContactId, role: Role) -> Result<()> {
        self.send(EngineCmd::StartSession { contact, role }).await
    }

    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn stop_session(&self, contact: ContactId, role: Role) -> Result<()> {
        self.send(EngineCmd::StopSession { contact, role }).await
    }

    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn cancel_session(&self, contact: ContactId, role: Role) -> Result<()> {
        self.send(EngineCmd::CancelSession { contact, role }).await
    }

    /// Queries the full engine state.
    ///
    /// # Errors
    ///
    /// `EngineStopped` once the engine loop has exited.
    pub async fn state(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCmd::GetState { reply }).await?;
        rx.await.map_err(|_| ProxyError::EngineStopped)
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Configuration shared by all sessions created by the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Identifies this running client on the social network.
    pub instance_id: String,
    /// Where GETTER sessions bind their SOCKS endpoint.
    pub socks_bind: String,
    /// Upper bound on the signaling handshake of one session.
    pub handshake_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            socks_bind: "127.0.0.1:0".into(),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// The peerproxy engine.
///
/// Owns the consent state, the contact registry and every proxy session of
/// this instance. The network event channel exists before the engine runs
/// so the social network adapter, which needs its sender, can be built
/// first and handed to [`start`](Self::start).
pub struct Engine {
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
    network_rx: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        Self {
            network_tx,
            network_rx,
        }
    }

    pub fn network_sender(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.network_tx.clone()
    }

    /// Spawn the engine event loop and return a handle to control it.
    pub fn start<C, F, K, V>(
        self,
        channel: C,
        listeners: F,
        connector: K,
        vpn: V,
        config: EngineConfig,
    ) -> CoreConnector
    where
        C: SocialChannel,
        F: ListenerFactory,
        K: Connector,
        V: VpnDevice,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(32);
        let (events_tx, _) = broadcast::channel::<EngineEvent>(128);

        info!(instance_id = %config.instance_id, "Spawning engine event loop");

        let services = Services {
            channel: Arc::new(channel),
            listeners: Arc::new(listeners),
            connector: Arc::new(connector),
            vpn: Arc::new(VpnSlot::new(vpn)),
            config: Arc::new(config),
        };
        let manager = SessionManager::new(services, events_tx.clone());
        tokio::spawn(run_engine_loop(manager, cmd_rx, self.network_rx));

        CoreConnector {
            cmd_tx,
            events_tx,
            network_tx: self.network_tx,
        }
    }
}

/// The main engine event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Engine` itself.
async fn run_engine_loop<C, F, K, V>(
    mut manager: SessionManager<C, F, K, V>,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    mut network_rx: mpsc::UnboundedReceiver<NetworkEvent>,
) where
    C: SocialChannel,
    F: ListenerFactory,
    K: Connector,
    V: VpnDevice,
{
    debug!("Engine event loop running");

    loop {
        tokio::select! {
            biased;

            // ── Session reports ─────────────────────────────────
            Some((session_id, event)) = manager.session_events_rx.recv() => {
                manager.on_session_event(session_id, event);
            }

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCmd::ShutDown) | None => {
                        info!("Engine shutting down");
                        break;
                    }
                    Some(cmd) => handle_command(&mut manager, cmd).await,
                }
            }

            // ── Social network ──────────────────────────────────
            Some(event) = network_rx.recv() => {
                manager.on_network(event).await;
            }
        }
    }

    manager.shutdown().await;
    debug!("Engine event loop exited");
}

async fn handle_command<C, F, K, V>(manager: &mut SessionManager<C, F, K, V>, cmd: EngineCmd)
where
    C: SocialChannel,
    F: ListenerFactory,
    K: Connector,
    V: VpnDevice,
{
    debug!(?cmd, "Engine command");
    match cmd {
        EngineCmd::ModifyConsent { contact, action } => {
            if let Err(e) = manager.modify_consent(&contact, action).await {
                manager.report(Some(contact), &e);
            }
        }
        EngineCmd::StartSession { contact, role } => {
            if let Err(e) = manager.start_session(&contact, role).await {
                manager.report(Some(contact), &e);
            }
        }
        EngineCmd::StopSession { contact, role } => {
            if let Err(e) = manager.stop_session(&contact, role).await {
                manager.report(Some(contact), &e);
            }
        }
        EngineCmd::CancelSession { contact, role } => {
            if let Err(e) = manager.cancel_session(&contact, role).await {
                manager.report(Some(contact), &e);
            }
        }
        EngineCmd::StartVpn => {
            if let Err(e) = manager.start_vpn().await {
                manager.report(None, &e);
            }
        }
        EngineCmd::StopVpn => {
            if let Err(e) = manager.stop_vpn().await {
                manager.report(None, &e);
            }
        }
        EngineCmd::GetState { reply } => {
            let _ = reply.send(manager.snapshot());
        }
        EngineCmd::ShutDown => {}
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::memory::LoopbackNetwork;
    use crate::tcp::{TcpConnector, TcpListenerFactory};
    use crate::testing::{FakeVpn, echo_server};
    use peerproxy_core::contact::LocalIdentity;

    struct Node {
        core: CoreConnector,
        events: broadcast::Receiver<EngineEvent>,
        identity: LocalIdentity,
    }

    impl Node {
        fn contact(&self, user_id: &str) -> ContactId {
            self.identity.contact(user_id)
        }
    }

    fn test_config(instance_id: &str, handshake_timeout: Duration) -> EngineConfig {
        EngineConfig {
            instance_id: instance_id.into(),
            socks_bind: "127.0.0.1:0".into(),
            handshake_timeout,
        }
    }

    fn spawn_node(net: &LoopbackNetwork, user_id: &str, instance_id: &str) -> Node {
        spawn_node_with(net, user_id, instance_id, FakeVpn::default())
    }

    fn spawn_node_with(net: &LoopbackNetwork, user_id: &str, instance_id: &str, vpn: FakeVpn) -> Node {
        let engine = Engine::new();
        let channel = net.join(user_id, instance_id, engine.network_sender());
        let identity = channel.identity().clone();
        let core = engine.start(
            channel,
            TcpListenerFactory,
            TcpConnector,
            vpn,
            test_config(instance_id, Duration::from_secs(5)),
        );
        let events = core.subscribe();
        Node {
            core,
            events,
            identity,
        }
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<EngineEvent>,
        matches_fn: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if matches_fn(&ev) => return ev,
                    Ok(_) => {}
                    Err(e) => panic!("event channel error: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_state(
        rx: &mut broadcast::Receiver<EngineEvent>,
        role: Role,
        state: SessionState,
    ) -> EngineEvent {
        wait_for_event(rx, |e| {
            matches!(e, EngineEvent::SessionStateChanged { role: r, state: s, .. }
                if *r == role && *s == state)
        })
        .await
    }

    /// Alice requests access, Bob offers it, and both see mutual consent.
    async fn agree_alice_gets_from_bob(alice: &mut Node, bob: &mut Node) {
        alice
            .core
            .modify_consent(alice.contact("bob"), UserAction::Request)
            .await
            .unwrap();
        bob.core
            .modify_consent(bob.contact("alice"), UserAction::Offer)
            .await
            .unwrap();
        wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ConsentReached { role: Role::Getter, .. })
        })
        .await;
        wait_for_event(&mut bob.events, |e| {
            matches!(e, EngineEvent::ConsentReached { role: Role::Sharer, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn when_peers_join_expect_contact_updates() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let _bob = spawn_node(&net, "bob", "b1");

        let ev = wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ContactUpdated { .. })
        })
        .await;
        let EngineEvent::ContactUpdated { contact } = ev else {
            unreachable!()
        };
        assert_eq!(contact.id, alice.contact("bob"));
        assert!(contact.is_online());
    }

    #[tokio::test]
    async fn given_no_consent_when_requesting_then_flag_set_without_consent_reached() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let _bob = spawn_node(&net, "bob", "b1");

        alice
            .core
            .modify_consent(alice.contact("bob"), UserAction::Request)
            .await
            .unwrap();

        let ev = wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ConsentChanged { state, .. } if state.local_requests_access)
        })
        .await;
        let EngineEvent::ConsentChanged { state, .. } = ev else {
            unreachable!()
        };
        assert!(!state.remote_offers_access);

        let snapshot = alice.core.state().await.unwrap();
        assert!(snapshot.sessions.is_empty());
        while let Ok(ev) = alice.events.try_recv() {
            assert!(
                !matches!(ev, EngineEvent::ConsentReached { .. }),
                "unexpected {ev:?}"
            );
        }
    }

    #[tokio::test]
    async fn given_mutual_consent_when_getter_starts_then_connected_with_endpoint() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;

        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();

        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connecting).await;
        let ev = wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;
        let EngineEvent::SessionStateChanged { endpoint, .. } = ev else {
            unreachable!()
        };
        let endpoint = endpoint.expect("getter session exposes an endpoint");
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_ne!(endpoint.port, 0);

        wait_for_state(&mut bob.events, Role::Sharer, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn given_connected_session_when_peer_goes_offline_then_failed_unreachable() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;

        net.set_online("bob", "b1", false);

        let ev = wait_for_state(&mut alice.events, Role::Getter, SessionState::Failed).await;
        let EngineEvent::SessionStateChanged { reason, endpoint, .. } = ev else {
            unreachable!()
        };
        assert_eq!(reason, Some(ProxyError::PeerUnreachable));
        assert!(endpoint.is_none());

        // No VPN was bound, so none was stopped.
        while let Ok(ev) = alice.events.try_recv() {
            assert!(!matches!(ev, EngineEvent::VpnStopped { .. }), "unexpected {ev:?}");
        }
    }

    #[tokio::test]
    async fn given_no_remote_offer_when_getter_starts_then_consent_not_mutual_error() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let _bob = spawn_node(&net, "bob", "b1");
        alice
            .core
            .modify_consent(alice.contact("bob"), UserAction::Request)
            .await
            .unwrap();

        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();

        let ev = wait_for_event(&mut alice.events, |e| matches!(e, EngineEvent::Error { .. })).await;
        let EngineEvent::Error { contact, kind, .. } = ev else {
            unreachable!()
        };
        assert_eq!(kind, ErrorKind::ConsentNotMutual);
        assert_eq!(contact, Some(alice.contact("bob")));
    }

    #[tokio::test]
    async fn given_second_getter_when_started_then_first_is_stopped_before_second_connects() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        let carol = spawn_node(&net, "carol", "c1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        alice
            .core
            .modify_consent(alice.contact("carol"), UserAction::Request)
            .await
            .unwrap();
        carol
            .core
            .modify_consent(carol.contact("alice"), UserAction::Offer)
            .await
            .unwrap();
        wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ConsentReached { contact, .. } if contact.user_id == "carol")
        })
        .await;

        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;

        alice
            .core
            .start_session(alice.contact("carol"), Role::Getter)
            .await
            .unwrap();

        let mut order = Vec::new();
        while order.last() != Some(&("carol".to_string(), SessionState::Connected)) {
            let ev = wait_for_event(&mut alice.events, |e| {
                matches!(e, EngineEvent::SessionStateChanged { .. })
            })
            .await;
            if let EngineEvent::SessionStateChanged { contact, state, .. } = ev {
                order.push((contact.user_id, state));
            }
        }
        assert_eq!(
            order,
            vec![
                ("bob".to_string(), SessionState::Disconnecting),
                ("bob".to_string(), SessionState::Idle),
                ("carol".to_string(), SessionState::Connecting),
                ("carol".to_string(), SessionState::Connected),
            ]
        );
        // Bob learns about the stop from the close signal.
        wait_for_state(&mut bob.events, Role::Sharer, SessionState::Failed).await;
    }

    #[tokio::test]
    async fn given_active_getter_when_peer_asks_to_share_with_us_then_rejected() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        let mut carol = spawn_node(&net, "carol", "c1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        // Carol offers and starts sharing towards Alice on her own.
        alice
            .core
            .modify_consent(alice.contact("carol"), UserAction::Request)
            .await
            .unwrap();
        carol
            .core
            .modify_consent(carol.contact("alice"), UserAction::Offer)
            .await
            .unwrap();
        wait_for_event(&mut carol.events, |e| {
            matches!(e, EngineEvent::ConsentReached { role: Role::Sharer, .. })
        })
        .await;
        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;

        carol
            .core
            .start_session(carol.contact("alice"), Role::Sharer)
            .await
            .unwrap();

        let ev = wait_for_state(&mut carol.events, Role::Sharer, SessionState::Failed).await;
        let EngineEvent::SessionStateChanged { reason, .. } = ev else {
            unreachable!()
        };
        assert!(matches!(reason, Some(ProxyError::HandshakeRejected(r)) if r.contains("getter")));
    }

    #[tokio::test]
    async fn given_connected_session_when_consent_withdrawn_then_session_stops() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;

        bob.core
            .modify_consent(bob.contact("alice"), UserAction::CancelOffer)
            .await
            .unwrap();

        wait_for_event(&mut bob.events, |e| {
            matches!(e, EngineEvent::ConsentWithdrawn { role: Role::Sharer, .. })
        })
        .await;
        wait_for_state(&mut bob.events, Role::Sharer, SessionState::Idle).await;

        // Bob's consent update arrives before his close.
        wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ConsentWithdrawn { role: Role::Getter, .. })
        })
        .await;
        let ended = wait_for_event(&mut alice.events, |e| {
            matches!(
                e,
                EngineEvent::SessionStateChanged {
                    role: Role::Getter,
                    state: SessionState::Idle | SessionState::Failed,
                    ..
                }
            )
        })
        .await;
        assert!(matches!(
            ended,
            EngineEvent::SessionStateChanged {
                state: SessionState::Idle,
                reason: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn given_silent_peer_when_getter_starts_then_handshake_times_out() {
        let net = LoopbackNetwork::new("loop");
        let engine = Engine::new();
        let channel = net.join("alice", "a1", engine.network_sender());
        let alice_id = channel.identity().clone();
        let core = engine.start(
            channel,
            TcpListenerFactory,
            TcpConnector,
            FakeVpn::default(),
            test_config("a1", Duration::from_millis(200)),
        );
        let mut alice = Node {
            events: core.subscribe(),
            core,
            identity: alice_id,
        };
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        net.set_silent("bob", "b1", true);

        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();

        let ev = wait_for_state(&mut alice.events, Role::Getter, SessionState::Failed).await;
        let EngineEvent::SessionStateChanged { reason, .. } = ev else {
            unreachable!()
        };
        assert_eq!(
            reason,
            Some(ProxyError::HandshakeTimeout(Duration::from_millis(200)))
        );
    }

    #[tokio::test]
    async fn given_failing_vpn_stop_when_vpn_stopped_then_binding_released_with_error() {
        let net = LoopbackNetwork::new("loop");
        let vpn = FakeVpn::default();
        vpn.fail_stop.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut alice = spawn_node_with(&net, "alice", "a1", vpn);
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;

        alice.core.send(EngineCmd::StartVpn).await.unwrap();
        wait_for_event(&mut alice.events, |e| matches!(e, EngineEvent::VpnStarted { .. })).await;

        alice
            .core
            .stop_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();

        let ev = wait_for_event(&mut alice.events, |e| matches!(e, EngineEvent::VpnStopped { .. })).await;
        let EngineEvent::VpnStopped { result, .. } = ev else {
            unreachable!()
        };
        assert!(result.unwrap_err().contains("device wedged"));
        wait_for_state(&mut alice.events, Role::Getter, SessionState::Idle).await;

        alice.core.send(EngineCmd::StopVpn).await.unwrap();
        let ev = wait_for_event(&mut alice.events, |e| matches!(e, EngineEvent::Error { .. })).await;
        assert!(matches!(ev, EngineEvent::Error { kind: ErrorKind::Device, .. }));
    }

    #[tokio::test]
    async fn given_connected_session_when_socks_client_connects_then_traffic_is_relayed() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let mut bob = spawn_node(&net, "bob", "b1");
        agree_alice_gets_from_bob(&mut alice, &mut bob).await;
        let echo_port = echo_server().await;

        alice
            .core
            .start_session(alice.contact("bob"), Role::Getter)
            .await
            .unwrap();
        let ev = wait_for_state(&mut alice.events, Role::Getter, SessionState::Connected).await;
        let EngineEvent::SessionStateChanged {
            endpoint: Some(endpoint),
            ..
        } = ev
        else {
            panic!("connected getter without endpoint");
        };

        let mut client = TcpStream::connect(endpoint.to_string()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let port = echo_port.to_be_bytes();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);

        client.write_all(b"ping through bob").await.unwrap();
        let mut echoed = [0u8; 16];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping through bob");
    }

    #[tokio::test]
    async fn when_state_queried_expect_snapshot_with_contacts_and_consent() {
        let net = LoopbackNetwork::new("loop");
        let mut alice = spawn_node(&net, "alice", "a1");
        let _bob = spawn_node(&net, "bob", "b1");
        alice
            .core
            .modify_consent(alice.contact("bob"), UserAction::Offer)
            .await
            .unwrap();
        wait_for_event(&mut alice.events, |e| {
            matches!(e, EngineEvent::ConsentChanged { state, .. } if state.local_offers_access)
        })
        .await;

        let snapshot = alice.core.state().await.unwrap();
        assert_eq!(snapshot.contacts.len(), 1);
        assert_eq!(snapshot.contacts[0].id, alice.contact("bob"));
        assert_eq!(snapshot.consent.len(), 1);
        assert!(snapshot.consent[0].1.local_offers_access);
    }

    #[tokio::test]
    async fn when_shut_down_expect_commands_rejected() {
        let net = LoopbackNetwork::new("loop");
        let alice = spawn_node(&net, "alice", "a1");

        alice.core.send(EngineCmd::ShutDown).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while alice.core.state().await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("engine kept running after shutdown");
    }
}
