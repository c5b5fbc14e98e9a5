//! Connectors: the session layer under a [`Link`](crate::Link).
//!
//! A connector owns one peer relationship. It terminates the handshake and
//! heartbeat frames, numbers and buffers outbound routable envelopes, and
//! hands inbound routable frames to its link through an [`Inbound`] channel.
//! Lifecycle changes are published as [`ConnectorEvent`]s.
//!
//! # Client states
//!
//! ```text
//!            connect()
//!   New ─────────────────► Handshake ◄───────────────┐
//!    ▲                        │ ready / continue      │ socket lost
//!    │ close()                ▼                       │ (reconnect)
//!    ├────────────────── Connected ───────────────────┘
//!    │                        │ set_closing()
//!    └────────────────── Closing
//!
//!   auth failure / reconnect timeout ──► Closed
//! ```

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tether_core::envelope::interval_from_secs;
use tether_core::{
    Address, CLOSE_AUTH_FAILED, CLOSE_PROTOCOL_ERROR, ConnectorConfig, Continue,
    DisconnectPhase, Envelope, Frame, LinkError, Ready, Registration, Result, Resume,
};
use tether_transport::{CloseFrame, Connection, Dialer};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::session::{
    HeartbeatTick, SessionCore, SocketOwner, spawn_heartbeat, spawn_reader, spawn_writer,
};

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 64;

/// Connector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Not connected, no session
    New,
    /// Socket open (or being reopened), session not yet established
    Handshake,
    /// Session established
    Connected,
    /// Cooperative shutdown in progress; sends still go out
    Closing,
    /// Terminated after an unrecoverable failure
    Closed,
}

/// Lifecycle notification published by a connector
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// Session established (`resumed` when restored via `continue`)
    Connect {
        /// True if an existing session was resumed
        resumed: bool,
    },
    /// The socket of an established session was lost; reconnecting
    Drop,
    /// The session ended
    Close,
    /// The peer no longer honours the session token; re-registering
    Invalidate,
    /// A failure the connector handled internally
    Error(LinkError),
}

/// What a connector hands to its link
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A routable frame, not yet validated
    Message(Frame),
    /// A `disconnect` frame
    Disconnect(DisconnectPhase),
    /// The session was invalidated or closed
    SessionLost,
}

/// The session layer a link runs on
#[async_trait]
pub trait Connector: Send + Sync {
    /// Our own address on this connection
    fn src(&self) -> Address;

    /// The peer's address
    fn dst(&self) -> Address;

    /// Current lifecycle state
    async fn state(&self) -> ConnectorState;

    /// Number, buffer and (when connected) transmit a routable envelope
    ///
    /// # Errors
    ///
    /// Returns `LinkError::SessionLost` in the `New` and `Closed` states and
    /// `LinkError::InvalidMessage` for non-routable envelopes.
    async fn send(&self, envelope: Envelope) -> Result<u64>;

    /// Send a `disconnect` frame
    ///
    /// # Errors
    ///
    /// Returns `LinkError::SessionLost` if no socket is attached.
    async fn send_disconnect(&self, phase: DisconnectPhase) -> Result<()>;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent>;

    /// Take the inbound channel (only the first caller gets it)
    ///
    /// Routable frames and session notices queue without bound until the
    /// channel is taken and drained, so a connector carrying routable
    /// traffic needs a consumer (normally a [`Link`](crate::Link)).
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Inbound>>;

    /// Signal cooperative shutdown
    async fn set_closing(&self);

    /// Close the socket and end the session
    async fn close(&self, code: u16, reason: &str);
}

/// Event and inbound channels shared by client and server connectors
#[derive(Debug)]
pub(crate) struct Notifier {
    events: broadcast::Sender<ConnectorEvent>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            events,
            inbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
        }
    }

    pub(crate) fn emit(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }

    /// Queue for the link; held until `take_inbound` is called
    pub(crate) fn push(&self, inbound: Inbound) {
        let _ = self.inbound_tx.send(inbound);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Handle a frame on an established session
///
/// Routable frames are deduplicated by `seq` and passed on; heartbeats trim
/// the replay buffer. Returns the reason for a protocol violation.
pub(crate) fn handle_session_frame(
    session: &mut SessionCore,
    notifier: &Notifier,
    frame: Frame,
) -> std::result::Result<(), String> {
    if frame.is_routable() {
        if let Some(seq) = frame.seq {
            if !session.accept_seq(seq) {
                tracing::debug!(seq, "Dropping duplicate {}", frame.kind);
                return Ok(());
            }
        }
        notifier.push(Inbound::Message(frame));
        return Ok(());
    }

    match Envelope::from_frame(&frame).map_err(|e| e.to_string())? {
        Envelope::Heartbeat(heartbeat) => {
            if let Some(ack) = heartbeat.seq {
                session.acknowledge(ack);
            }
            Ok(())
        }
        Envelope::Disconnect(phase) => {
            notifier.push(Inbound::Disconnect(phase));
            Ok(())
        }
        other => Err(format!("unexpected {} on an established session", other.kind())),
    }
}

struct ClientState {
    phase: ConnectorState,
    session: SessionCore,
    session_token: Option<String>,
    session_timeout: Option<Duration>,
    account: Option<serde_json::Value>,
    generation: u64,
    reconnect: Option<JoinHandle<()>>,
    reconnect_started: Option<Instant>,
}

struct ClientShared {
    dialer: Box<dyn Dialer>,
    registration: Registration,
    config: ConnectorConfig,
    src: RwLock<Address>,
    dst: Address,
    notifier: Notifier,
    state: Mutex<ClientState>,
}

/// Client side connector (hosts and control clients)
///
/// Dials the peer, registers or resumes, keeps the session alive with
/// heartbeats and reconnects with a flat jittered delay after a drop until
/// the session timeout runs out.
///
/// Inbound routable frames are held for [`Connector::take_inbound`]; build a
/// [`Link`](crate::Link) on the connector, or take and drain the channel,
/// before the peer starts sending.
#[derive(Clone)]
pub struct ClientConnector {
    shared: Arc<ClientShared>,
}

impl ClientConnector {
    /// Create a connector that registers with `registration`
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if `config` fails validation.
    pub fn new(
        dialer: impl Dialer + 'static,
        registration: Registration,
        config: ConnectorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let src = match &registration {
            Registration::Host(host) => Address::host(host.id),
            Registration::Control(_) => Address::control(0),
        };
        Ok(Self {
            shared: Arc::new(ClientShared {
                dialer: Box::new(dialer),
                registration,
                config,
                src: RwLock::new(src),
                dst: Address::controller(),
                notifier: Notifier::new(),
                state: Mutex::new(ClientState {
                    phase: ConnectorState::New,
                    session: SessionCore::new(),
                    session_token: None,
                    session_timeout: None,
                    account: None,
                    generation: 0,
                    reconnect: None,
                    reconnect_started: None,
                }),
            }),
        })
    }

    /// Open the connection and wait for a session
    ///
    /// # Errors
    ///
    /// - `LinkError::InvalidState` if already connecting or connected
    /// - `LinkError::Transport` if the first dial fails
    /// - `LinkError::AuthenticationFailed` if the peer rejects the registration
    /// - `LinkError::Timeout` if no session is established within the
    ///   configured connect timeout
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let mut events = shared.notifier.subscribe();
        {
            let mut state = shared.state.lock().await;
            if !matches!(state.phase, ConnectorState::New | ConnectorState::Closed) {
                return Err(LinkError::invalid_state(
                    "connector is already connecting or connected",
                ));
            }
            state.phase = ConnectorState::Handshake;
            state.reconnect_started = None;
        }

        tracing::info!("Connecting to {}", shared.dialer.describe());
        let connection = match shared.dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                shared.state.lock().await.phase = ConnectorState::New;
                return Err(LinkError::Transport(e.to_string()));
            }
        };
        {
            let mut state = shared.state.lock().await;
            if state.phase != ConnectorState::Handshake {
                return Err(LinkError::session_lost("connector closed while connecting"));
            }
            shared.install(&mut state, connection);
        }

        let established = async {
            loop {
                match events.recv().await {
                    Ok(ConnectorEvent::Connect { .. }) => return Ok(()),
                    Ok(ConnectorEvent::Error(e)) if e.is_permanent() => return Err(e),
                    Ok(ConnectorEvent::Close) => {
                        return Err(LinkError::session_lost(
                            "connection closed before a session was established",
                        ));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(LinkError::session_lost("connector dropped"));
                    }
                }
            }
        };

        match tokio::time::timeout(shared.config.connect_timeout(), established).await {
            Ok(result) => result,
            Err(_) => {
                self.close(tether_core::CLOSE_NORMAL, "Connect timeout").await;
                Err(LinkError::timeout(
                    "no session established within the connect timeout",
                ))
            }
        }
    }

    /// Sequence number the next send will be assigned
    pub async fn next_seq(&self) -> u64 {
        self.shared.state.lock().await.session.next_seq()
    }

    /// Sequence numbers still awaiting acknowledgement
    pub async fn unacknowledged(&self) -> Vec<u64> {
        self.shared.state.lock().await.session.send_buffer().seqs()
    }

    /// Token of the current session
    pub async fn session_token(&self) -> Option<String> {
        self.shared.state.lock().await.session_token.clone()
    }

    /// Account details the peer sent in `ready`
    pub async fn account(&self) -> Option<serde_json::Value> {
        self.shared.state.lock().await.account.clone()
    }

    /// Heartbeat interval issued by the peer
    pub async fn heartbeat_interval(&self) -> Option<Duration> {
        self.shared.state.lock().await.session.heartbeat_interval()
    }

    /// Drop the current socket without a close handshake, as a network
    /// failure would
    pub async fn abort_socket(&self) {
        let mut state = self.shared.state.lock().await;
        if state.session.is_attached() {
            tracing::debug!("Aborting socket");
            self.shared.socket_lost(&mut state, None);
        }
    }
}

impl std::fmt::Debug for ClientConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnector")
            .field("peer", &self.shared.dialer.describe())
            .field("src", &self.shared.src())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for ClientConnector {
    fn src(&self) -> Address {
        self.shared.src()
    }

    fn dst(&self) -> Address {
        self.shared.dst
    }

    async fn state(&self) -> ConnectorState {
        self.shared.state.lock().await.phase
    }

    async fn send(&self, envelope: Envelope) -> Result<u64> {
        if !envelope.is_routable() {
            return Err(LinkError::invalid_message(
                "only routable envelopes are sequenced",
            ));
        }
        let mut state = self.shared.state.lock().await;
        match state.phase {
            ConnectorState::New | ConnectorState::Closed => {
                Err(LinkError::session_lost("connector is not connected"))
            }
            ConnectorState::Handshake => state.session.push_routable(&envelope, false),
            ConnectorState::Connected | ConnectorState::Closing => {
                state.session.push_routable(&envelope, true)
            }
        }
    }

    async fn send_disconnect(&self, phase: DisconnectPhase) -> Result<()> {
        let state = self.shared.state.lock().await;
        let established = matches!(
            state.phase,
            ConnectorState::Connected | ConnectorState::Closing
        );
        if established && state.session.send_unsequenced(&Envelope::Disconnect(phase))? {
            Ok(())
        } else {
            Err(LinkError::session_lost("no connection to send disconnect on"))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.shared.notifier.subscribe()
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.shared.notifier.take_inbound()
    }

    async fn set_closing(&self) {
        let mut state = self.shared.state.lock().await;
        if state.phase == ConnectorState::Connected {
            tracing::debug!("Connector closing");
            state.phase = ConnectorState::Closing;
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut state = self.shared.state.lock().await;
        if matches!(state.phase, ConnectorState::New | ConnectorState::Closed) {
            return;
        }
        tracing::info!(code, "Closing connection: {}", reason);
        state.session.close_socket(code, reason);
        state.generation += 1;
        self.shared.finish(&mut state, ConnectorState::New);
    }
}

impl ClientShared {
    fn src(&self) -> Address {
        *self.src.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_src(&self, src: Address) {
        *self.src.write().unwrap_or_else(PoisonError::into_inner) = src;
    }

    fn install(self: &Arc<Self>, state: &mut ClientState, connection: Connection) {
        state.generation += 1;
        state.session.attach(spawn_writer(connection.sink));
        spawn_reader(Arc::downgrade(self), state.generation, connection.stream);

        let weak = Arc::downgrade(self);
        let generation = state.generation;
        let deadline = self.config.handshake_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.handshake_expired(generation).await;
            }
        });
    }

    /// Drop a socket that never got past the handshake and dial again
    async fn handshake_expired(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.phase != ConnectorState::Handshake {
            return;
        }
        tracing::warn!(
            code = CLOSE_PROTOCOL_ERROR,
            "No session from {} within the handshake timeout",
            self.dialer.describe()
        );
        state.session.close_socket(CLOSE_PROTOCOL_ERROR, "Handshake timeout");
        self.socket_lost(&mut state, None);
    }

    fn start_heartbeat(self: &Arc<Self>, state: &mut ClientState, interval: Duration) {
        let task = spawn_heartbeat(Arc::downgrade(self), state.generation, interval);
        state.session.start_heartbeat(interval, task);
    }

    fn protocol_error(self: &Arc<Self>, state: &mut ClientState, reason: &str) {
        tracing::warn!(code = CLOSE_PROTOCOL_ERROR, "Protocol violation: {}", reason);
        state.session.close_socket(CLOSE_PROTOCOL_ERROR, reason);
        self.notifier
            .emit(ConnectorEvent::Error(LinkError::InvalidMessage(
                reason.to_string().into(),
            )));
        self.socket_lost(state, None);
    }

    fn handle_handshake(self: &Arc<Self>, state: &mut ClientState, frame: Frame) {
        let envelope = match Envelope::from_frame(&frame) {
            Ok(envelope) => envelope,
            Err(e) => return self.protocol_error(state, &e.to_string()),
        };

        match envelope {
            Envelope::Hello(hello) => {
                tracing::debug!(version = %hello.version, "Received hello");
                let reply = match &state.session_token {
                    Some(token) => Envelope::Resume(Resume {
                        session_token: token.clone(),
                        last_seq: state.session.last_received_seq(),
                    }),
                    None => self.registration.clone().into_envelope(),
                };
                if let Err(e) = state.session.send_unsequenced(&reply) {
                    tracing::warn!("Failed to encode {}: {}", reply.kind(), e);
                }
            }
            Envelope::Ready(ready) => self.on_ready(state, ready),
            Envelope::Continue(cont) => self.on_continue(state, cont),
            Envelope::Invalidate => self.on_invalidate(state),
            other => {
                self.protocol_error(state, &format!("unexpected {} during handshake", other.kind()));
            }
        }
    }

    fn on_ready(self: &Arc<Self>, state: &mut ClientState, ready: Ready) {
        let interval = match interval_from_secs(ready.heartbeat_interval) {
            Ok(interval) => interval,
            Err(e) => return self.protocol_error(state, &e.to_string()),
        };
        self.set_src(ready.src);
        state.session_token = Some(ready.session_token);
        state.session_timeout = Some(Duration::from_secs(ready.session_timeout));
        state.account = ready.account;
        state.phase = ConnectorState::Connected;
        state.reconnect_started = None;
        state.session.flush();
        self.start_heartbeat(state, interval);

        tracing::info!("Connected to {} as {}", self.dialer.describe(), ready.src);
        self.notifier.emit(ConnectorEvent::Connect { resumed: false });
    }

    fn on_continue(self: &Arc<Self>, state: &mut ClientState, cont: Continue) {
        if state.session_token.is_none() {
            return self.protocol_error(state, "continue without a session");
        }
        let interval = match interval_from_secs(cont.heartbeat_interval) {
            Ok(interval) => interval,
            Err(e) => return self.protocol_error(state, &e.to_string()),
        };
        state.session_timeout = Some(Duration::from_secs(cont.session_timeout));
        if let Some(ack) = cont.last_seq {
            state.session.acknowledge(ack);
        }
        state.phase = ConnectorState::Connected;
        state.reconnect_started = None;
        state.session.flush();
        self.start_heartbeat(state, interval);

        tracing::info!(
            replayed = state.session.send_buffer().len(),
            "Resumed session with {}",
            self.dialer.describe()
        );
        self.notifier.emit(ConnectorEvent::Connect { resumed: true });
    }

    fn on_invalidate(self: &Arc<Self>, state: &mut ClientState) {
        tracing::warn!("Session invalidated by {}, registering again", self.dialer.describe());
        state.session_token = None;
        state.session_timeout = None;
        state.session.reset();
        self.notifier.emit(ConnectorEvent::Invalidate);
        self.notifier.push(Inbound::SessionLost);

        let register = self.registration.clone().into_envelope();
        if let Err(e) = state.session.send_unsequenced(&register) {
            tracing::warn!("Failed to encode registration: {}", e);
        }
    }

    /// The socket is gone: reconnect, or finish a cooperative close
    fn socket_lost(self: &Arc<Self>, state: &mut ClientState, frame: Option<CloseFrame>) {
        state.generation += 1;
        state.session.detach();

        match state.phase {
            ConnectorState::New | ConnectorState::Closed => {}
            ConnectorState::Closing => self.finish(state, ConnectorState::New),
            ConnectorState::Handshake | ConnectorState::Connected => {
                if let Some(frame) = frame.filter(|f| f.code == CLOSE_AUTH_FAILED) {
                    tracing::warn!(code = frame.code, "Authentication failed: {}", frame.reason);
                    self.notifier
                        .emit(ConnectorEvent::Error(LinkError::AuthenticationFailed(
                            frame.reason,
                        )));
                    self.finish(state, ConnectorState::Closed);
                    return;
                }
                if state.phase == ConnectorState::Connected {
                    tracing::info!("Connection to {} dropped", self.dialer.describe());
                    self.notifier.emit(ConnectorEvent::Drop);
                }
                state.phase = ConnectorState::Handshake;
                self.reconnect(state);
            }
        }
    }

    /// Schedule a reconnect attempt unless one is already pending
    fn reconnect(self: &Arc<Self>, state: &mut ClientState) {
        if state.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let now = Instant::now();
        let started = *state.reconnect_started.get_or_insert(now);
        let timeout = state
            .session_timeout
            .unwrap_or_else(|| self.config.session_timeout());
        if now.duration_since(started) > timeout {
            tracing::warn!("Gave up reconnecting after {:?}", timeout);
            self.notifier
                .emit(ConnectorEvent::Error(LinkError::session_lost("reconnect timed out")));
            self.finish(state, ConnectorState::Closed);
            return;
        }

        let delay = self.config.reconnect_delay().mul_f64(rand::random::<f64>());
        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting to {}",
            self.dialer.describe()
        );
        let weak = Arc::downgrade(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.attempt_reconnect().await;
            }
        }));
    }

    async fn attempt_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.reconnect = None;
            if state.phase != ConnectorState::Handshake || state.session.is_attached() {
                return;
            }
        }

        let result = self.dialer.dial().await;

        let mut state = self.state.lock().await;
        if state.phase != ConnectorState::Handshake || state.session.is_attached() {
            return;
        }
        match result {
            Ok(connection) => self.install(&mut state, connection),
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", self.dialer.describe(), e);
                self.reconnect(&mut state);
            }
        }
    }

    /// End the session and settle in `phase`
    fn finish(&self, state: &mut ClientState, phase: ConnectorState) {
        if let Some(task) = state.reconnect.take() {
            task.abort();
        }
        state.session.detach();
        state.session.reset();
        state.session_token = None;
        state.session_timeout = None;
        state.reconnect_started = None;
        state.phase = phase;

        tracing::debug!(?phase, "Session ended");
        self.notifier.emit(ConnectorEvent::Close);
        self.notifier.push(Inbound::SessionLost);
    }
}

#[async_trait]
impl SocketOwner for ClientShared {
    async fn on_text(self: Arc<Self>, generation: u64, text: String) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.session.touch();

        let frame = match Frame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => return self.protocol_error(&mut state, &e.to_string()),
        };
        match state.phase {
            ConnectorState::Handshake => self.handle_handshake(&mut state, frame),
            ConnectorState::Connected | ConnectorState::Closing => {
                if let Err(reason) = handle_session_frame(&mut state.session, &self.notifier, frame)
                {
                    self.protocol_error(&mut state, &reason);
                }
            }
            ConnectorState::New | ConnectorState::Closed => {}
        }
    }

    async fn on_closed(self: Arc<Self>, generation: u64, frame: Option<CloseFrame>) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        tracing::debug!(code = frame.as_ref().map(|f| f.code), "Socket closed");
        self.socket_lost(&mut state, frame);
    }

    async fn on_heartbeat_tick(self: Arc<Self>, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation
            || !matches!(
                state.phase,
                ConnectorState::Connected | ConnectorState::Closing
            )
        {
            return false;
        }
        match state.session.heartbeat_tick() {
            HeartbeatTick::Sent => true,
            HeartbeatTick::TimedOut => {
                tracing::warn!(
                    code = tether_core::CLOSE_HEARTBEAT_TIMEOUT,
                    "Heartbeat timeout, closing connection"
                );
                state
                    .session
                    .close_socket(tether_core::CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout");
                self.socket_lost(&mut state, None);
                false
            }
        }
    }
}
