use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use peerproxy_core::channel::{NetworkEvent, SocialChannel, VpnDevice};
use peerproxy_core::consent::{ConsentAction, UserAction};
use peerproxy_core::contact::{Contact, ContactId, PeerRef, Role};
use peerproxy_core::error::{ErrorKind, ProxyError, Result};
use peerproxy_core::negotiation::{ConsentEvent, ConsentStateMachine};
use peerproxy_core::protocol::Signal;
use peerproxy_core::session::{Endpoint, SessionState};
use peerproxy_core::store::ConsentChange;
use peerproxy_core::transport::{Connector, ListenerFactory};

use crate::engine::{EngineEvent, EngineSnapshot, SessionSummary};
use crate::session::{Services, SessionEvent, SessionHandle, StopReport};

struct SessionEntry {
    peer: PeerRef,
    role: Role,
    /// Last state reported by the actor.
    state: SessionState,
    endpoint: Option<Endpoint>,
    token: Option<Uuid>,
    handle: SessionHandle,
}

/// Supervises every proxy session of this instance.
///
/// Owns the contact registry, the consent state machine and the session
/// table, and reacts to user commands, network events and session reports.
/// Only one getter session may be active at a time; starting another one
/// first stops (or cancels) the current one and waits for it to finish.
pub struct SessionManager<C, F, K, V> {
    services: Services<C, F, K, V>,
    consent: ConsentStateMachine,
    consent_rx: mpsc::UnboundedReceiver<ConsentChange>,
    contacts: HashMap<ContactId, Contact>,
    sessions: BTreeMap<u64, SessionEntry>,
    tokens: HashMap<Uuid, u64>,
    next_session_id: u64,
    session_events_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    pub(crate) session_events_rx: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
    events: broadcast::Sender<EngineEvent>,
}

impl<C, F, K, V> SessionManager<C, F, K, V>
where
    C: SocialChannel,
    F: ListenerFactory,
    K: Connector,
    V: VpnDevice,
{
    pub fn new(services: Services<C, F, K, V>, events: broadcast::Sender<EngineEvent>) -> Self {
        let mut consent = ConsentStateMachine::default();
        let consent_rx = consent.subscribe();
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        Self {
            services,
            consent,
            consent_rx,
            contacts: HashMap::new(),
            sessions: BTreeMap::new(),
            tokens: HashMap::new(),
            next_session_id: 1,
            session_events_tx,
            session_events_rx,
            events,
        }
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Publishes `err` as an [`EngineEvent::Error`].
    pub fn report(&self, contact: Option<ContactId>, err: &ProxyError) {
        match &contact {
            Some(contact) => warn!(contact = %contact, error = %err, "Operation failed"),
            None => warn!(error = %err, "Operation failed"),
        }
        self.publish(EngineEvent::Error {
            contact,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    // ── Consent ─────────────────────────────────────────────────

    /// Applies a local consent action and reacts to the resulting change.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the action is not legal; nothing changes.
    pub async fn modify_consent(&mut self, contact: &ContactId, action: UserAction) -> Result<()> {
        self.drain_session_events();
        self.consent.apply_user(contact, action)?;
        self.process_consent_changes().await;
        Ok(())
    }

    async fn process_consent_changes(&mut self) {
        while let Ok(change) = self.consent_rx.try_recv() {
            self.publish(EngineEvent::ConsentChanged {
                contact: change.contact.clone(),
                state: change.new.flags(),
            });

            if matches!(change.action, Some(ConsentAction::User(_)))
                && change.old.local_view() != change.new.local_view()
            {
                self.announce_consent(&change.contact).await;
            }

            for edge in ConsentStateMachine::observe(&change) {
                match edge {
                    ConsentEvent::Reached { contact, role } => {
                        info!(contact = %contact, role = %role, "Mutual consent reached");
                        self.publish(EngineEvent::ConsentReached { contact, role });
                    }
                    ConsentEvent::Withdrawn { contact, role } => {
                        info!(contact = %contact, role = %role, "Mutual consent withdrawn");
                        self.publish(EngineEvent::ConsentWithdrawn {
                            contact: contact.clone(),
                            role,
                        });
                        self.terminate(&contact, role).await;
                    }
                }
            }
        }
    }

    /// Sends our side of the consent relationship to every online instance.
    async fn announce_consent(&mut self, contact: &ContactId) {
        let view = self.consent.get(contact).local_view();
        let peers: Vec<PeerRef> = self
            .contacts
            .get(contact)
            .filter(|c| c.is_online())
            .map(|c| c.peers().collect())
            .unwrap_or_default();
        for peer in peers {
            self.send_signal(&peer, Signal::ConsentUpdate(view)).await;
        }
    }

    /// Stops or cancels the active sessions with `contact` in `role`.
    async fn terminate(&mut self, contact: &ContactId, role: Role) {
        self.drain_session_events();
        let ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.peer.contact == *contact && e.role == role && e.state.is_active())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Err(e) = self.end_session(id).await {
                self.report(Some(contact.clone()), &e);
            }
        }
    }

    /// Ends one session: cancel while connecting, stop once connected.
    /// Returns after its teardown completed.
    async fn end_session(&mut self, id: u64) -> Result<()> {
        let Some(entry) = self.sessions.get(&id) else {
            return Ok(());
        };
        let handle = entry.handle.clone();
        let result = match entry.state {
            SessionState::Connecting => match handle.cancel().await {
                Err(ProxyError::InvalidState {
                    state: SessionState::Connected,
                    ..
                }) => handle.stop().await,
                other => other,
            },
            SessionState::Connected => handle.stop().await,
            _ => return Ok(()),
        };
        self.drain_session_events();
        match result {
            Ok(_)
            | Err(ProxyError::InvalidState {
                state: SessionState::Idle | SessionState::Failed,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Session commands ────────────────────────────────────────

    /// Starts a session with `contact` in `role`, returning its id.
    ///
    /// # Errors
    ///
    /// `ConsentNotMutual` without mutual consent, `UnknownContact` or
    /// `PeerUnreachable` if the contact cannot be addressed, plus anything
    /// the session itself rejects the start with.
    pub async fn start_session(&mut self, contact: &ContactId, role: Role) -> Result<u64> {
        self.drain_session_events();
        if !self.consent.is_mutual(contact, role) {
            return Err(ProxyError::ConsentNotMutual { role });
        }
        let instances = match self.contacts.get(contact) {
            None => return Err(ProxyError::UnknownContact(contact.to_string())),
            Some(c) if !c.is_online() || c.instance_ids.is_empty() => {
                return Err(ProxyError::PeerUnreachable);
            }
            Some(c) => c.instance_ids.clone(),
        };

        if role == Role::Getter {
            let previous: Vec<u64> = self
                .sessions
                .iter()
                .filter(|(_, e)| {
                    e.role == Role::Getter && e.state.is_active() && e.peer.contact != *contact
                })
                .map(|(id, _)| *id)
                .collect();
            for id in previous {
                info!(session_id = id, "Ending previous getter session");
                self.end_session(id).await?;
            }
        }

        let existing = self
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.peer.contact == *contact && e.role == role && instances.contains(&e.peer.instance_id)
            })
            .max_by_key(|(_, e)| e.state.is_active())
            .map(|(id, _)| *id);
        let id = match existing {
            Some(id) => id,
            None => {
                let peer = PeerRef::new(contact.clone(), instances[0].clone());
                self.create_session(peer, role)
            }
        };

        let handle = self.prepare(id).await?;
        let token = Uuid::new_v4();
        handle.start(token).await?;
        self.bind_token(id, token);
        self.drain_session_events();
        Ok(id)
    }

    /// Stops the session with `contact` in `role`.
    ///
    /// # Errors
    ///
    /// `SessionBusy` while it is connecting, `InvalidState` when there is
    /// nothing to stop.
    pub async fn stop_session(&mut self, contact: &ContactId, role: Role) -> Result<StopReport> {
        self.drain_session_events();
        let handle = self.find(contact, role, "stop")?;
        let result = handle.stop().await;
        self.drain_session_events();
        result
    }

    /// Cancels a connecting session with `contact` in `role`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless that session is connecting.
    pub async fn cancel_session(&mut self, contact: &ContactId, role: Role) -> Result<StopReport> {
        self.drain_session_events();
        let handle = self.find(contact, role, "cancel")?;
        let result = handle.cancel().await;
        self.drain_session_events();
        result
    }

    /// Routes the VPN device through the connected getter session.
    ///
    /// # Errors
    ///
    /// `NoProxyEndpoint` without a connected getter, `DeviceBusy` or
    /// `Device` from the device.
    pub async fn start_vpn(&mut self) -> Result<String> {
        self.drain_session_events();
        let handle = self
            .sessions
            .values()
            .find(|e| {
                e.role == Role::Getter
                    && e.state == SessionState::Connected
                    && e.endpoint.is_some()
            })
            .map(|e| e.handle.clone())
            .ok_or(ProxyError::NoProxyEndpoint)?;
        let result = handle.bind_vpn().await;
        self.drain_session_events();
        result
    }

    /// Stops the VPN device, wherever it is bound.
    ///
    /// # Errors
    ///
    /// `Device` if it is not running or fails to stop.
    pub async fn stop_vpn(&mut self) -> Result<String> {
        self.drain_session_events();
        let handle = self
            .services
            .vpn
            .owner()
            .and_then(|id| self.sessions.get(&id))
            .map(|e| e.handle.clone())
            .ok_or_else(|| ProxyError::Device("VPN device is not running".into()))?;
        let result = handle.unbind_vpn().await;
        self.drain_session_events();
        result
    }

    fn find(&self, contact: &ContactId, role: Role, op: &'static str) -> Result<SessionHandle> {
        self.sessions
            .values()
            .filter(|e| e.peer.contact == *contact && e.role == role)
            .max_by_key(|e| e.state != SessionState::Idle && e.state != SessionState::Failed)
            .filter(|e| e.state != SessionState::Idle && e.state != SessionState::Failed)
            .map(|e| e.handle.clone())
            .ok_or(ProxyError::InvalidState {
                op,
                state: SessionState::Idle,
            })
    }

    fn create_session(&mut self, peer: PeerRef, role: Role) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        debug!(session_id = id, peer = %peer, role = %role, "Creating session");
        let handle = SessionHandle::spawn(
            id,
            peer.clone(),
            role,
            self.services.clone(),
            self.session_events_tx.clone(),
        );
        self.sessions.insert(
            id,
            SessionEntry {
                peer,
                role,
                state: SessionState::Idle,
                endpoint: None,
                token: None,
                handle,
            },
        );
        id
    }

    /// Resets a failed session so it can be started again.
    async fn prepare(&mut self, id: u64) -> Result<SessionHandle> {
        let entry = self
            .sessions
            .get(&id)
            .ok_or(ProxyError::EngineStopped)?;
        let handle = entry.handle.clone();
        if entry.state == SessionState::Failed {
            handle.reset().await?;
            self.drain_session_events();
        }
        Ok(handle)
    }

    fn bind_token(&mut self, id: u64, token: Uuid) {
        self.tokens.insert(token, id);
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.token = Some(token);
        }
    }

    // ── Session reports ─────────────────────────────────────────

    pub fn drain_session_events(&mut self) {
        while let Ok((id, event)) = self.session_events_rx.try_recv() {
            self.on_session_event(id, event);
        }
    }

    pub fn on_session_event(&mut self, id: u64, event: SessionEvent) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            trace!(session_id = id, "Event from removed session");
            return;
        };
        let contact = entry.peer.contact.clone();

        match event {
            SessionEvent::StateChanged {
                state,
                endpoint,
                reason,
            } => {
                entry.state = state;
                entry.endpoint.clone_from(&endpoint);
                if matches!(state, SessionState::Idle | SessionState::Failed) {
                    if let Some(token) = entry.token.take() {
                        self.tokens.remove(&token);
                    }
                }
                let role = entry.role;
                self.publish(EngineEvent::SessionStateChanged {
                    contact: contact.clone(),
                    role,
                    session_id: id,
                    state,
                    endpoint,
                    reason: reason.clone(),
                });
                if let Some(reason) = reason {
                    self.report(Some(contact), &reason);
                }
            }
            SessionEvent::VpnStarted { message } => {
                self.publish(EngineEvent::VpnStarted { contact, message });
            }
            SessionEvent::VpnStopped { result } => {
                self.publish(EngineEvent::VpnStopped { contact, result });
            }
        }
    }

    // ── Network ─────────────────────────────────────────────────

    pub async fn on_network(&mut self, event: NetworkEvent) {
        self.drain_session_events();
        match event {
            NetworkEvent::Presence(contact) => self.on_presence(contact).await,
            NetworkEvent::Message { from, payload } => self.on_message(from, &payload).await,
            NetworkEvent::ContactRemoved(contact) => self.on_contact_removed(&contact).await,
        }
    }

    async fn on_presence(&mut self, contact: Contact) {
        let id = contact.id.clone();
        debug!(contact = %id, presence = ?contact.presence, instances = ?contact.instance_ids, "Presence update");
        let previous = self.contacts.insert(id.clone(), contact.clone());
        let view = self.consent.get(&id).local_view();
        self.publish(EngineEvent::ContactUpdated {
            contact: contact.clone(),
        });

        if contact.is_online() {
            for peer in contact.peers() {
                let known = previous
                    .as_ref()
                    .is_some_and(|p| p.is_online() && p.has_instance(&peer.instance_id));
                if !known {
                    self.send_signal(&peer, Signal::ConsentUpdate(view)).await;
                }
            }
        }

        let lost: Vec<SessionHandle> = self
            .sessions
            .values()
            .filter(|e| {
                e.peer.contact == id
                    && e.state.is_active()
                    && !(contact.is_online() && contact.has_instance(&e.peer.instance_id))
            })
            .map(|e| e.handle.clone())
            .collect();
        for handle in lost {
            info!(contact = %id, session_id = handle.session_id, "Peer instance went away");
            let _ = handle.fail(ProxyError::PeerUnreachable).await;
        }
        self.drain_session_events();
    }

    async fn on_contact_removed(&mut self, contact: &ContactId) {
        info!(contact = %contact, "Contact removed");
        let ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.peer.contact == *contact)
            .map(|(id, _)| *id)
            .collect();
        let active: Vec<SessionHandle> = ids
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|e| e.state.is_active())
            .map(|e| e.handle.clone())
            .collect();
        for handle in active {
            let _ = handle.fail(ProxyError::PeerUnreachable).await;
        }
        self.drain_session_events();
        for id in ids {
            if let Some(entry) = self.sessions.remove(&id) {
                entry.handle.shutdown().await;
            }
            self.tokens.retain(|_, session| *session != id);
        }

        self.contacts.remove(contact);
        self.publish(EngineEvent::ContactRemoved {
            contact: contact.clone(),
        });
        if self.consent.forget(contact).is_some() {
            self.process_consent_changes().await;
        }
    }

    async fn on_message(&mut self, from: PeerRef, payload: &Bytes) {
        if !self.contacts.contains_key(&from.contact) {
            warn!(peer = %from, "Dropping message from unknown contact");
            return;
        }
        let signal = match Signal::from_bytes(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed message");
                return;
            }
        };
        trace!(peer = %from, signal = ?signal, "Signal received");

        match signal {
            Signal::ConsentUpdate(remote) => {
                match self.consent.sync_remote(&from.contact, remote) {
                    Ok(_) => self.process_consent_changes().await,
                    Err(e) => self.report(Some(from.contact), &e),
                }
            }
            Signal::SessionRequest {
                token,
                initiator_role,
            } => self.on_session_request(from, token, initiator_role).await,
            Signal::Hello(_) | Signal::HelloAck(_) => {
                trace!(peer = %from, "Ignoring link-level greeting");
            }
            Signal::Error(p) => {
                warn!(peer = %from, code = %p.code, message = %p.message, "Peer reported an error");
                self.publish(EngineEvent::Error {
                    contact: Some(from.contact),
                    kind: ErrorKind::TransportError,
                    message: format!("peer reported {}: {}", p.code, p.message),
                });
            }
            other => self.route(&from, other).await,
        }
    }

    /// Hands a session-scoped signal to the session owning its token.
    async fn route(&self, from: &PeerRef, signal: Signal) {
        let Some(token) = signal.token() else {
            return;
        };
        let Some(entry) = self.tokens.get(&token).and_then(|id| self.sessions.get(id)) else {
            if matches!(signal, Signal::SessionAccept { .. }) {
                debug!(peer = %from, %token, "Accept for unknown session, closing it");
                let close = Signal::SessionClose {
                    token,
                    reason: Some("unknown session".into()),
                };
                self.send_signal(from, close).await;
            } else {
                trace!(peer = %from, %token, "Dropping signal for unknown session");
            }
            return;
        };
        if entry.peer != *from {
            warn!(peer = %from, expected = %entry.peer, "Signal from wrong peer instance");
            return;
        }
        entry.handle.signal(signal);
    }

    async fn on_session_request(&mut self, from: PeerRef, token: Uuid, initiator_role: Role) {
        let role = initiator_role.complement();
        if self.tokens.contains_key(&token) {
            debug!(peer = %from, %token, "Duplicate session request");
            return;
        }

        let rejection = if !self.consent.is_mutual(&from.contact, role) {
            Some("consent not mutual")
        } else if role == Role::Getter
            && self
                .sessions
                .values()
                .any(|e| e.role == Role::Getter && e.state.is_active())
        {
            Some("getter session already active")
        } else if self
            .sessions
            .values()
            .any(|e| e.peer == from && e.role == role && e.state.is_active())
        {
            Some("session already active")
        } else {
            None
        };
        if let Some(reason) = rejection {
            info!(peer = %from, role = %role, reason, "Rejecting session request");
            let reject = Signal::SessionReject {
                token,
                reason: reason.into(),
            };
            self.send_signal(&from, reject).await;
            return;
        }

        let existing = self
            .sessions
            .iter()
            .find(|(_, e)| e.peer == from && e.role == role)
            .map(|(id, _)| *id);
        let id = match existing {
            Some(id) => id,
            None => self.create_session(from.clone(), role),
        };

        let result = match self.prepare(id).await {
            Ok(handle) => {
                self.bind_token(id, token);
                handle.respond(token).await
            }
            Err(e) => Err(e),
        };
        self.drain_session_events();
        if let Err(e) = result {
            self.tokens.remove(&token);
            info!(peer = %from, role = %role, error = %e, "Could not accept session request");
            let reject = Signal::SessionReject {
                token,
                reason: e.to_string(),
            };
            self.send_signal(&from, reject).await;
            self.report(Some(from.contact), &e);
        }
    }

    async fn send_signal(&self, to: &PeerRef, signal: Signal) {
        let sent = match signal.encode() {
            Ok(payload) => self.services.channel.send(to, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(peer = %to, error = %e, "Failed to send signal");
        }
    }

    // ── Queries & lifecycle ─────────────────────────────────────

    pub fn snapshot(&mut self) -> EngineSnapshot {
        self.drain_session_events();
        let mut contacts: Vec<Contact> = self.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        let mut consent: Vec<_> = self
            .consent
            .store()
            .iter()
            .map(|(contact, state)| (contact.clone(), state.flags()))
            .collect();
        consent.sort_by(|a, b| a.0.cmp(&b.0));
        let sessions = self
            .sessions
            .iter()
            .map(|(id, e)| SessionSummary {
                session_id: *id,
                peer: e.peer.clone(),
                role: e.role,
                state: e.state,
                endpoint: e.endpoint.clone(),
            })
            .collect();
        EngineSnapshot {
            contacts,
            consent,
            sessions,
        }
    }

    /// Shuts every session down, notifying connected peers.
    pub async fn shutdown(&mut self) {
        for (id, entry) in std::mem::take(&mut self.sessions) {
            debug!(session_id = id, "Shutting down session");
            entry.handle.shutdown().await;
        }
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::tcp::{TcpConnector, TcpListenerFactory};
    use crate::testing::{FakeVpn, RecordingChannel, next_signal};
    use crate::vpn::VpnSlot;
    use peerproxy_core::consent::RemoteConsent;
    use peerproxy_core::contact::Presence;

    type TestManager = SessionManager<RecordingChannel, TcpListenerFactory, TcpConnector, FakeVpn>;

    fn manager() -> (
        TestManager,
        mpsc::UnboundedReceiver<(PeerRef, Signal)>,
        broadcast::Receiver<EngineEvent>,
    ) {
        manager_binding("127.0.0.1:0")
    }

    fn manager_binding(
        socks_bind: &str,
    ) -> (
        TestManager,
        mpsc::UnboundedReceiver<(PeerRef, Signal)>,
        broadcast::Receiver<EngineEvent>,
    ) {
        let (channel, sent) = RecordingChannel::new();
        let services = Services {
            channel,
            listeners: Arc::new(TcpListenerFactory),
            connector: Arc::new(TcpConnector),
            vpn: Arc::new(VpnSlot::new(FakeVpn::default())),
            config: Arc::new(EngineConfig {
                instance_id: "a1".into(),
                socks_bind: socks_bind.into(),
                handshake_timeout: Duration::from_secs(5),
            }),
        };
        let (events_tx, events) = broadcast::channel(64);
        (SessionManager::new(services, events_tx), sent, events)
    }

    fn bob() -> Contact {
        Contact {
            id: ContactId::new("direct", "alice", "bob"),
            display_name: "Bob".into(),
            presence: Presence::Online,
            instance_ids: vec!["b1".into()],
        }
    }

    fn bob_peer() -> PeerRef {
        PeerRef::new(bob().id, "b1")
    }

    async fn from_bob(m: &mut TestManager, signal: Signal) {
        let payload = signal.encode().unwrap();
        m.on_network(NetworkEvent::Message {
            from: bob_peer(),
            payload,
        })
        .await;
    }

    /// Feeds session reports to the manager until one reaches `state`.
    async fn settle(m: &mut TestManager, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (id, event) = m.session_events_rx.recv().await.unwrap();
                let reached =
                    matches!(&event, SessionEvent::StateChanged { state: s, .. } if *s == state);
                m.on_session_event(id, event);
                if reached {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for session state");
    }

    #[tokio::test]
    async fn given_local_offer_when_contact_appears_then_consent_announced_once() {
        let (mut m, mut sent, _events) = manager();
        m.modify_consent(&bob().id, UserAction::Offer).await.unwrap();

        m.on_network(NetworkEvent::Presence(bob())).await;
        let update = next_signal(&mut sent, |s| matches!(s, Signal::ConsentUpdate(_))).await;
        assert_eq!(
            update,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: false,
                offers_access: true,
            })
        );

        m.on_network(NetworkEvent::Presence(bob())).await;
        assert!(sent.try_recv().is_err(), "known instance announced twice");
    }

    #[tokio::test]
    async fn given_mutual_sharer_consent_when_request_arrives_then_accepted_and_duplicate_ignored() {
        let (mut m, mut sent, _events) = manager();
        m.on_network(NetworkEvent::Presence(bob())).await;
        m.modify_consent(&bob().id, UserAction::Offer).await.unwrap();
        from_bob(
            &mut m,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: true,
                offers_access: false,
            }),
        )
        .await;

        let token = Uuid::new_v4();
        let request = Signal::SessionRequest {
            token,
            initiator_role: Role::Getter,
        };
        from_bob(&mut m, request.clone()).await;
        let accept = next_signal(&mut sent, |s| {
            matches!(s, Signal::SessionAccept { .. } | Signal::SessionReject { .. })
        })
        .await;
        assert_eq!(accept, Signal::SessionAccept { token });

        from_bob(&mut m, request).await;
        let snapshot = m.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].role, Role::Sharer);
        assert_eq!(snapshot.sessions[0].state, SessionState::Connected);
        while let Ok((_, signal)) = sent.try_recv() {
            assert!(!matches!(signal, Signal::SessionReject { .. }), "duplicate was rejected");
        }
    }

    #[tokio::test]
    async fn given_no_consent_when_request_arrives_then_rejected_without_session() {
        let (mut m, mut sent, _events) = manager();
        m.on_network(NetworkEvent::Presence(bob())).await;

        let token = Uuid::new_v4();
        from_bob(
            &mut m,
            Signal::SessionRequest {
                token,
                initiator_role: Role::Sharer,
            },
        )
        .await;

        let reject = next_signal(&mut sent, |s| matches!(s, Signal::SessionReject { .. })).await;
        assert_eq!(
            reject,
            Signal::SessionReject {
                token,
                reason: "consent not mutual".into(),
            }
        );
        assert!(m.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn given_unknown_sender_when_message_arrives_then_dropped() {
        let (mut m, _sent, _events) = manager();

        from_bob(
            &mut m,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: true,
                offers_access: true,
            }),
        )
        .await;

        assert!(m.snapshot().consent.is_empty());
    }

    #[tokio::test]
    async fn given_connected_getter_when_contact_removed_then_failed_and_forgotten() {
        let (mut m, mut sent, mut events) = manager();
        m.on_network(NetworkEvent::Presence(bob())).await;
        m.modify_consent(&bob().id, UserAction::Request).await.unwrap();
        from_bob(
            &mut m,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: false,
                offers_access: true,
            }),
        )
        .await;

        m.start_session(&bob().id, Role::Getter).await.unwrap();
        let Signal::SessionRequest { token, .. } =
            next_signal(&mut sent, |s| matches!(s, Signal::SessionRequest { .. })).await
        else {
            unreachable!()
        };
        from_bob(&mut m, Signal::SessionAccept { token }).await;
        settle(&mut m, SessionState::Connected).await;

        m.on_network(NetworkEvent::ContactRemoved(bob().id)).await;

        let snapshot = m.snapshot();
        assert!(snapshot.sessions.is_empty());
        assert!(snapshot.contacts.is_empty());
        assert!(snapshot.consent.is_empty());

        let mut failed = false;
        let mut withdrawn = false;
        while let Ok(ev) = events.try_recv() {
            match ev {
                EngineEvent::SessionStateChanged {
                    state: SessionState::Failed,
                    reason,
                    ..
                } => {
                    assert_eq!(reason, Some(ProxyError::PeerUnreachable));
                    failed = true;
                }
                EngineEvent::ConsentWithdrawn {
                    role: Role::Getter, ..
                } => withdrawn = true,
                _ => {}
            }
        }
        assert!(failed && withdrawn);
    }

    #[tokio::test]
    async fn given_offline_contact_when_starting_then_peer_unreachable() {
        let (mut m, _sent, _events) = manager();
        let mut offline = bob();
        offline.presence = Presence::Offline;
        offline.instance_ids.clear();
        m.on_network(NetworkEvent::Presence(offline)).await;
        m.modify_consent(&bob().id, UserAction::Request).await.unwrap();
        from_bob(
            &mut m,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: false,
                offers_access: true,
            }),
        )
        .await;

        assert_eq!(
            m.start_session(&bob().id, Role::Getter).await,
            Err(ProxyError::PeerUnreachable)
        );
        assert_eq!(
            m.start_session(&ContactId::new("direct", "alice", "eve"), Role::Getter)
                .await,
            Err(ProxyError::ConsentNotMutual { role: Role::Getter })
        );
    }

    #[tokio::test]
    async fn when_accept_arrives_for_unknown_session_expect_close_reply() {
        let (mut m, mut sent, _events) = manager();
        m.on_network(NetworkEvent::Presence(bob())).await;
        let token = Uuid::new_v4();

        from_bob(&mut m, Signal::SessionAccept { token }).await;

        let close = next_signal(&mut sent, |s| matches!(s, Signal::SessionClose { .. })).await;
        assert_eq!(close.token(), Some(token));
    }

    #[tokio::test]
    async fn given_socks_port_in_use_when_request_arrives_then_rejected_with_bind_error() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap().to_string();
        let (mut m, mut sent, mut events) = manager_binding(&addr);
        m.on_network(NetworkEvent::Presence(bob())).await;
        m.modify_consent(&bob().id, UserAction::Request).await.unwrap();
        from_bob(
            &mut m,
            Signal::ConsentUpdate(RemoteConsent {
                requests_access: false,
                offers_access: true,
            }),
        )
        .await;

        let token = Uuid::new_v4();
        from_bob(
            &mut m,
            Signal::SessionRequest {
                token,
                initiator_role: Role::Sharer,
            },
        )
        .await;

        let reply = next_signal(&mut sent, |s| {
            matches!(s, Signal::SessionAccept { .. } | Signal::SessionReject { .. })
        })
        .await;
        assert!(matches!(reply, Signal::SessionReject { token: t, .. } if t == token));

        let mut reported = false;
        while let Ok(ev) = events.try_recv() {
            if let EngineEvent::Error { kind, .. } = ev {
                assert_eq!(kind, ErrorKind::TransportError);
                reported = true;
            }
        }
        assert!(reported, "bind failure is reported locally");
        assert!(m.snapshot().sessions.iter().all(|s| !s.state.is_active()));
        drop(occupied);
    }
}
