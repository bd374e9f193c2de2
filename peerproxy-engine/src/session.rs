use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use peerproxy_core::channel::{SocialChannel, VpnDevice};
use peerproxy_core::contact::{PeerRef, Role};
use peerproxy_core::error::{ProxyError, Result};
use peerproxy_core::protocol::Signal;
use peerproxy_core::session::{Endpoint, SessionState};
use peerproxy_core::transport::{Connector, Listener, ListenerFactory};

use crate::engine::EngineConfig;
use crate::relay::{self, StreamExit, StreamLink};
use crate::vpn::VpnSlot;

/// Pause before accepting again after the SOCKS listener reports an error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Collaborators shared by every session of one engine.
pub struct Services<C, F, K, V> {
    pub channel: Arc<C>,
    pub listeners: Arc<F>,
    pub connector: Arc<K>,
    pub vpn: Arc<VpnSlot<V>>,
    pub config: Arc<EngineConfig>,
}

impl<C, F, K, V> Clone for Services<C, F, K, V> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            listeners: Arc::clone(&self.listeners),
            connector: Arc::clone(&self.connector),
            vpn: Arc::clone(&self.vpn),
            config: Arc::clone(&self.config),
        }
    }
}

/// Reported by a session to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        endpoint: Option<Endpoint>,
        reason: Option<ProxyError>,
    },
    VpnStarted {
        message: String,
    },
    VpnStopped {
        result: std::result::Result<String, String>,
    },
}

/// Outcome of a completed stop or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Result of stopping the VPN device, if one was bound.
    pub vpn: Option<std::result::Result<String, String>>,
}

pub enum SessionCmd {
    /// Initiate with `token`. Replies once the request is on the wire.
    Start {
        token: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Accept a peer's request carrying `token`.
    Respond {
        token: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Graceful teardown of a connected session. Replies when it is Idle.
    Stop {
        reply: oneshot::Sender<Result<StopReport>>,
    },
    /// Abort a connecting session. Replies when it is Idle.
    Cancel {
        reply: oneshot::Sender<Result<StopReport>>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Force the session into Failed with `reason`.
    Fail {
        reason: ProxyError,
        reply: oneshot::Sender<()>,
    },
    /// A signaling message routed to this session by token.
    Signal(Signal),
    BindVpn {
        reply: oneshot::Sender<Result<String>>,
    },
    UnbindVpn {
        reply: oneshot::Sender<Result<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owner's side of a spawned session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionHandle {
    /// Spawns the actor for a session with `peer` in `role`. Events are
    /// tagged with `session_id` and sent to `events`.
    pub fn spawn<C, F, K, V>(
        session_id: u64,
        peer: PeerRef,
        role: Role,
        services: Services<C, F, K, V>,
        events: mpsc::UnboundedSender<(u64, SessionEvent)>,
    ) -> Self
    where
        C: SocialChannel,
        F: ListenerFactory,
        K: Connector,
        V: VpnDevice,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            id: session_id,
            peer,
            role,
            services,
            events,
            state: SessionState::Idle,
            token: None,
            endpoint: None,
            listener: None,
            deadline: None,
            accept_paused: None,
            streams: JoinSet::new(),
            inbound: HashMap::new(),
            next_stream_id: 1,
            vpn_bound: false,
            vpn_down: None,
            teardown: None,
            pending_stop: None,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { session_id, cmd_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCmd,
    ) -> std::result::Result<T, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| ProxyError::EngineStopped)?;
        rx.await.map_err(|_| ProxyError::EngineStopped)
    }

    /// # Errors
    ///
    /// `SessionBusy` while another start/stop is pending, `InvalidState`
    /// unless Idle, `TransportError` if the listener or channel fails.
    pub async fn start(&self, token: Uuid) -> Result<()> {
        self.request(|reply| SessionCmd::Start { token, reply }).await?
    }

    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub async fn respond(&self, token: Uuid) -> Result<()> {
        self.request(|reply| SessionCmd::Respond { token, reply }).await?
    }

    /// # Errors
    ///
    /// `SessionBusy` while connecting or disconnecting, `InvalidState`
    /// when not connected.
    pub async fn stop(&self) -> Result<StopReport> {
        self.request(|reply| SessionCmd::Stop { reply }).await?
    }

    /// # Errors
    ///
    /// `InvalidState` unless connecting.
    pub async fn cancel(&self) -> Result<StopReport> {
        self.request(|reply| SessionCmd::Cancel { reply }).await?
    }

    /// # Errors
    ///
    /// `InvalidState` unless Failed or Idle.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| SessionCmd::Reset { reply }).await?
    }

    /// # Errors
    ///
    /// `EngineStopped` if the actor is gone.
    pub async fn fail(&self, reason: ProxyError) -> Result<()> {
        self.request(|reply| SessionCmd::Fail { reason, reply }).await
    }

    pub fn signal(&self, signal: Signal) {
        if self.cmd_tx.send(SessionCmd::Signal(signal)).is_err() {
            debug!(session_id = self.session_id, "Dropping signal for stopped session");
        }
    }

    /// # Errors
    ///
    /// `NoProxyEndpoint` unless this is a connected getter, `DeviceBusy`
    /// if another session holds the device, `Device` if it fails to start.
    pub async fn bind_vpn(&self) -> Result<String> {
        self.request(|reply| SessionCmd::BindVpn { reply }).await?
    }

    /// # Errors
    ///
    /// `Device` if the device is not bound here or fails to stop.
    pub async fn unbind_vpn(&self) -> Result<String> {
        self.request(|reply| SessionCmd::UnbindVpn { reply }).await?
    }

    pub async fn shutdown(&self) {
        let _ = self.request(|reply| SessionCmd::Shutdown { reply }).await;
    }
}

/// Single owner of one session's state and resources.
struct SessionActor<C, F: ListenerFactory, K, V> {
    id: u64,
    peer: PeerRef,
    role: Role,
    services: Services<C, F, K, V>,
    events: mpsc::UnboundedSender<(u64, SessionEvent)>,

    state: SessionState,
    token: Option<Uuid>,
    endpoint: Option<Endpoint>,
    /// SOCKS endpoint of a getter, bound from start until teardown.
    listener: Option<F::L>,
    /// Handshake deadline while Connecting as initiator.
    deadline: Option<Instant>,
    /// Accepting resumes at this instant after a failed accept.
    accept_paused: Option<Instant>,
    streams: JoinSet<StreamExit>,
    /// Bytes from the peer, per open stream.
    inbound: HashMap<u64, mpsc::UnboundedSender<Bytes>>,
    next_stream_id: u64,
    vpn_bound: bool,
    vpn_down: Option<oneshot::Receiver<String>>,
    /// Completes once the peer is notified and the VPN is stopped.
    teardown: Option<oneshot::Receiver<Option<std::result::Result<String, String>>>>,
    pending_stop: Option<oneshot::Sender<Result<StopReport>>>,
}

impl<C, F, K, V> SessionActor<C, F, K, V>
where
    C: SocialChannel,
    F: ListenerFactory,
    K: Connector,
    V: VpnDevice,
{
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>) {
        debug!(session_id = self.id, peer = %self.peer, role = %self.role, "Session actor running");

        loop {
            let accepting = self.state == SessionState::Connected
                && self.listener.is_some()
                && self.accept_paused.is_none();
            let has_streams = !self.streams.is_empty();

            tokio::select! {
                biased;

                done = recv_opt(&mut self.teardown) => {
                    self.teardown = None;
                    self.on_teardown_done(done.unwrap_or(None));
                }

                down = recv_opt(&mut self.vpn_down) => {
                    self.vpn_down = None;
                    if let Ok(reason) = down {
                        self.on_vpn_disconnect(reason);
                    }
                }

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let SessionCmd::Shutdown { reply } = cmd {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    self.handle_cmd(cmd).await;
                }

                () = sleep_until_opt(self.deadline) => {
                    self.deadline = None;
                    if self.state == SessionState::Connecting {
                        let timeout = self.services.config.handshake_timeout;
                        warn!(session_id = self.id, ?timeout, "Handshake timed out");
                        self.fail(ProxyError::HandshakeTimeout(timeout), Some("handshake timeout"));
                    }
                }

                () = sleep_until_opt(self.accept_paused) => {
                    self.accept_paused = None;
                }

                res = accept_next(&mut self.listener), if accepting => match res {
                    Ok(conn) => self.open_getter_stream(conn),
                    Err(e) => {
                        warn!(session_id = self.id, error = %e, "SOCKS accept failed");
                        self.accept_paused = Some(Instant::now() + ACCEPT_BACKOFF);
                    }
                },

                Some(joined) = self.streams.join_next(), if has_streams => {
                    if let Ok(exit) = joined {
                        self.on_stream_exit(exit);
                    }
                }

            }
        }

        debug!(session_id = self.id, "Session actor stopped");
    }

    async fn handle_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Start { token, reply } => {
                let _ = reply.send(self.start(token).await);
            }
            SessionCmd::Respond { token, reply } => {
                let _ = reply.send(self.respond(token).await);
            }
            SessionCmd::Stop { reply } => match self.begin_stop() {
                Ok(()) => self.pending_stop = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionCmd::Cancel { reply } => match self.begin_cancel() {
                Ok(()) => self.pending_stop = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionCmd::Reset { reply } => {
                let _ = reply.send(self.reset());
            }
            SessionCmd::Fail { reason, reply } => {
                if self.state.is_active() {
                    self.fail(reason, None);
                }
                let _ = reply.send(());
            }
            SessionCmd::Signal(signal) => self.on_signal(signal).await,
            SessionCmd::BindVpn { reply } => {
                let _ = reply.send(self.bind_vpn().await);
            }
            SessionCmd::UnbindVpn { reply } => {
                let _ = reply.send(self.unbind_vpn().await);
            }
            SessionCmd::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────

    fn check_startable(&self) -> Result<()> {
        match self.state {
            SessionState::Idle if self.teardown.is_none() => Ok(()),
            SessionState::Idle | SessionState::Connecting | SessionState::Disconnecting => {
                Err(ProxyError::SessionBusy {
                    session_id: self.id,
                })
            }
            state => Err(ProxyError::InvalidState { op: "start", state }),
        }
    }

    /// Binds the SOCKS endpoint when this side is the getter.
    async fn bind_endpoint(&mut self) -> Result<()> {
        if self.role != Role::Getter {
            return Ok(());
        }
        let bind_addr = &self.services.config.socks_bind;
        let listener = self
            .services
            .listeners
            .bind(bind_addr)
            .await
            .map_err(|e| ProxyError::transport(&e))?;
        let endpoint = Endpoint::from_addr(&listener.local_addr())
            .map_err(|e| ProxyError::transport(&e))?;
        info!(session_id = self.id, endpoint = %endpoint, "SOCKS endpoint bound");
        self.endpoint = Some(endpoint);
        self.listener = Some(listener);
        Ok(())
    }

    /// The returned future owns its channel and peer, so the actor is not
    /// borrowed while the send is pending.
    fn send(&self, signal: Signal) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        let channel = Arc::clone(&self.services.channel);
        let peer = self.peer.clone();
        async move {
            let payload = signal.encode()?;
            channel.send(&peer, payload).await
        }
    }

    async fn start(&mut self, token: Uuid) -> Result<()> {
        self.check_startable()?;
        self.bind_endpoint().await?;

        let request = Signal::SessionRequest {
            token,
            initiator_role: self.role,
        };
        if let Err(e) = self.send(request).await {
            warn!(session_id = self.id, error = %e, "Failed to send session request");
            self.listener = None;
            self.endpoint = None;
            return Err(ProxyError::transport(&e));
        }

        self.token = Some(token);
        self.deadline = Some(Instant::now() + self.services.config.handshake_timeout);
        info!(session_id = self.id, peer = %self.peer, role = %self.role, "Session requested");
        self.set_state(SessionState::Connecting, None);
        Ok(())
    }

    async fn respond(&mut self, token: Uuid) -> Result<()> {
        self.check_startable()?;
        self.bind_endpoint().await?;
        self.token = Some(token);
        self.set_state(SessionState::Connecting, None);

        if let Err(e) = self.send(Signal::SessionAccept { token }).await {
            let err = ProxyError::transport(&e);
            self.fail(err.clone(), None);
            return Err(err);
        }
        info!(session_id = self.id, peer = %self.peer, role = %self.role, "Session accepted");
        self.set_state(SessionState::Connected, None);
        Ok(())
    }

    fn begin_stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connected => {
                info!(session_id = self.id, "Stopping session");
                self.set_state(SessionState::Disconnecting, None);
                self.release(Some("stopped"));
                Ok(())
            }
            SessionState::Connecting | SessionState::Disconnecting => {
                Err(ProxyError::SessionBusy {
                    session_id: self.id,
                })
            }
            state => Err(ProxyError::InvalidState { op: "stop", state }),
        }
    }

    fn begin_cancel(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting => {
                info!(session_id = self.id, "Cancelling session");
                self.deadline = None;
                self.set_state(SessionState::Disconnecting, None);
                self.release(Some("cancelled"));
                Ok(())
            }
            state => Err(ProxyError::InvalidState { op: "cancel", state }),
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self.state {
            SessionState::Failed => {
                self.set_state(SessionState::Idle, None);
                Ok(())
            }
            SessionState::Idle => Ok(()),
            state => Err(ProxyError::InvalidState { op: "reset", state }),
        }
    }

    async fn bind_vpn(&mut self) -> Result<String> {
        let port = match (&self.state, &self.endpoint) {
            (SessionState::Connected, Some(endpoint)) => endpoint.port,
            _ => return Err(ProxyError::NoProxyEndpoint),
        };
        if self.vpn_bound {
            return Ok(format!("VPN already routing through port {port}"));
        }
        self.services.vpn.claim(self.id)?;

        let (down_tx, down_rx) = oneshot::channel();
        match self.services.vpn.device().start(port, down_tx).await {
            Ok(message) => {
                info!(session_id = self.id, port, "VPN device bound");
                self.vpn_bound = true;
                self.vpn_down = Some(down_rx);
                self.emit(SessionEvent::VpnStarted {
                    message: message.clone(),
                });
                Ok(message)
            }
            Err(e) => {
                self.services.vpn.release(self.id);
                Err(ProxyError::Device(format!("{e:#}")))
            }
        }
    }

    async fn unbind_vpn(&mut self) -> Result<String> {
        if !self.vpn_bound {
            return Err(ProxyError::Device("VPN device is not running".into()));
        }
        self.vpn_bound = false;
        self.vpn_down = None;
        let result = self
            .services
            .vpn
            .device()
            .stop()
            .await
            .map_err(|e| format!("{e:#}"));
        self.services.vpn.release(self.id);
        self.emit(SessionEvent::VpnStopped {
            result: result.clone(),
        });
        result.map_err(ProxyError::Device)
    }

    // ── Inbound signaling ───────────────────────────────────────

    async fn on_signal(&mut self, signal: Signal) {
        if signal.token() != self.token || self.token.is_none() {
            trace!(session_id = self.id, "Ignoring signal for another token");
            return;
        }

        match signal {
            Signal::SessionAccept { .. } if self.state == SessionState::Connecting => {
                self.deadline = None;
                info!(session_id = self.id, peer = %self.peer, "Session established");
                self.set_state(SessionState::Connected, None);
            }
            Signal::SessionReject { reason, .. } if self.state == SessionState::Connecting => {
                info!(session_id = self.id, reason = %reason, "Session rejected by peer");
                self.fail(ProxyError::HandshakeRejected(reason), None);
            }
            Signal::SessionClose { reason, .. } if self.state.is_active() => {
                let reason = reason.unwrap_or_else(|| "no reason given".into());
                info!(session_id = self.id, reason = %reason, "Session closed by peer");
                self.fail(
                    ProxyError::TransportError(format!("closed by peer: {reason}")),
                    None,
                );
            }
            Signal::StreamOpen { stream_id, .. }
                if self.state == SessionState::Connected && self.role == Role::Sharer =>
            {
                self.open_sharer_stream(stream_id);
            }
            Signal::StreamData {
                stream_id, data, ..
            } => {
                if let Some(tx) = self.inbound.get(&stream_id) {
                    let _ = tx.send(data);
                }
            }
            Signal::StreamClose { stream_id, .. } => {
                self.inbound.remove(&stream_id);
            }
            other => {
                debug!(session_id = self.id, state = ?self.state, signal = ?other, "Ignoring signal");
            }
        }
    }

    // ── Streams ─────────────────────────────────────────────────

    fn link(&self, stream_id: u64) -> Option<StreamLink<C>> {
        let token = self.token?;
        Some(StreamLink::new(
            Arc::clone(&self.services.channel),
            self.peer.clone(),
            token,
            stream_id,
        ))
    }

    fn open_getter_stream(&mut self, conn: <F::L as Listener>::Conn) {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let Some(link) = self.link(stream_id) else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound.insert(stream_id, tx);
        self.streams.spawn(relay::run_getter_stream(conn, link, rx));
    }

    fn open_sharer_stream(&mut self, stream_id: u64) {
        if self.inbound.contains_key(&stream_id) {
            warn!(session_id = self.id, stream_id, "Duplicate stream id from peer");
            return;
        }
        let Some(link) = self.link(stream_id) else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound.insert(stream_id, tx);
        self.streams.spawn(relay::run_sharer_stream(
            Arc::clone(&self.services.connector),
            link,
            rx,
        ));
    }

    fn on_stream_exit(&mut self, exit: StreamExit) {
        self.inbound.remove(&exit.stream_id);
        let Some(err) = exit.channel_error else {
            return;
        };
        if self.state.is_active() {
            warn!(session_id = self.id, stream_id = exit.stream_id, error = %err, "Social channel failed");
            self.fail(ProxyError::TransportError(err), None);
        }
    }

    // ── Teardown ────────────────────────────────────────────────

    fn on_vpn_disconnect(&mut self, reason: String) {
        if !self.vpn_bound {
            return;
        }
        warn!(session_id = self.id, reason = %reason, "VPN device disconnected");
        self.vpn_bound = false;
        self.services.vpn.release(self.id);
        self.emit(SessionEvent::VpnStopped {
            result: Err(reason.clone()),
        });
        if self.state.is_active() {
            self.fail(
                ProxyError::TransportError(format!("VPN device disconnected: {reason}")),
                Some("VPN device disconnected"),
            );
        }
    }

    fn fail(&mut self, reason: ProxyError, notify: Option<&str>) {
        warn!(session_id = self.id, peer = %self.peer, reason = %reason, "Session failed");
        self.deadline = None;
        self.release(notify);
        self.set_state(SessionState::Failed, Some(reason));
    }

    /// Drops local resources now and spawns the slow part: notifying the
    /// peer and stopping a bound VPN device.
    fn release(&mut self, notify: Option<&str>) {
        self.listener = None;
        self.endpoint = None;
        self.accept_paused = None;
        self.streams.abort_all();
        self.inbound.clear();
        self.vpn_down = None;

        let close = match (notify, self.token.take()) {
            (Some(reason), Some(token)) => Some(Signal::SessionClose {
                token,
                reason: Some(reason.to_string()),
            }),
            _ => None,
        };
        let vpn = std::mem::take(&mut self.vpn_bound).then(|| Arc::clone(&self.services.vpn));
        let (done_tx, done_rx) = oneshot::channel();
        self.teardown = Some(done_rx);
        if close.is_none() && vpn.is_none() {
            let _ = done_tx.send(None);
            return;
        }

        let channel = Arc::clone(&self.services.channel);
        let peer = self.peer.clone();
        let session_id = self.id;

        tokio::spawn(async move {
            if let Some(close) = close {
                let sent = match close.encode() {
                    Ok(payload) => channel.send(&peer, payload).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    debug!(session_id, error = %e, "Could not notify peer of session close");
                }
            }
            let vpn_result = match vpn {
                Some(vpn) => {
                    let result = vpn.device().stop().await.map_err(|e| format!("{e:#}"));
                    vpn.release(session_id);
                    Some(result)
                }
                None => None,
            };
            let _ = done_tx.send(vpn_result);
        });
    }

    fn on_teardown_done(&mut self, vpn: Option<std::result::Result<String, String>>) {
        if let Some(result) = &vpn {
            if let Err(e) = result {
                warn!(session_id = self.id, error = %e, "VPN device failed to stop");
            }
            self.emit(SessionEvent::VpnStopped {
                result: result.clone(),
            });
        }
        if self.state == SessionState::Disconnecting {
            self.set_state(SessionState::Idle, None);
            if let Some(reply) = self.pending_stop.take() {
                let _ = reply.send(Ok(StopReport { vpn }));
            }
        }
    }

    async fn shutdown(&mut self) {
        if let (true, Some(token)) = (self.state.is_active(), self.token) {
            let close = Signal::SessionClose {
                token,
                reason: Some("shutting down".into()),
            };
            if let Err(e) = self.send(close).await {
                debug!(session_id = self.id, error = %e, "Could not notify peer of shutdown");
            }
        }
        self.streams.abort_all();
        if self.vpn_bound {
            self.vpn_bound = false;
            if let Err(e) = self.services.vpn.device().stop().await {
                warn!(session_id = self.id, error = %e, "VPN device failed to stop");
            }
            self.services.vpn.release(self.id);
        }
    }

    // ── Events ──────────────────────────────────────────────────

    fn set_state(&mut self, state: SessionState, reason: Option<ProxyError>) {
        debug!(session_id = self.id, from = ?self.state, to = ?state, "Session state");
        self.state = state;
        self.emit(SessionEvent::StateChanged {
            state,
            endpoint: self.endpoint.clone(),
            reason,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send((self.id, event));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn accept_next<L: Listener>(listener: &mut Option<L>) -> anyhow::Result<L::Conn> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(
    rx: &mut Option<oneshot::Receiver<T>>,
) -> std::result::Result<T, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}
