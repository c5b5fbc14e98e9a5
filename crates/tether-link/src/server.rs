//! Accept side of the handshake.
//!
//! [`ServerEndpoint::accept`] greets a new socket with `hello` and waits for
//! the peer to register or resume:
//!
//! ```text
//! register*  ── authenticate ──► ok:   ready{src, sessionToken, ...}   → Accepted::New
//!                              └► fail: close 4003
//! resume     ── token known? ──► yes:  continue{lastSeq} + replay      → Accepted::Resumed
//!                              └► no:   invalidate, wait for register*
//! ```
//!
//! Each session is a [`ServerConnector`]. When its socket drops the session
//! is kept for `session_timeout` so the peer can resume; after that it is
//! closed and every pending waiter on its link fails with `SessionLost`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{
    Address, CLOSE_AUTH_FAILED, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_PROTOCOL_ERROR, Continue,
    DisconnectPhase, Envelope, Frame, Hello, LinkError, Ready, Registration, Result, ServerConfig,
};
use tether_transport::{CloseFrame, Connection, FrameSink, Incoming, TransportError};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::connector::{
    Connector, ConnectorEvent, ConnectorState, Inbound, Notifier, handle_session_frame,
};
use crate::session::{
    HeartbeatTick, SessionCore, SocketOwner, spawn_heartbeat, spawn_reader, spawn_writer,
};

/// Identity assigned to a registering peer
#[derive(Debug, Clone, PartialEq)]
pub struct Authenticated {
    /// Address the peer will use
    pub address: Address,
    /// Account details sent back in `ready`
    pub account: Option<Value>,
}

/// Validates registration credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check a registration and assign the peer its address
    ///
    /// # Errors
    ///
    /// Returns `LinkError::AuthenticationFailed` to reject the peer.
    async fn authenticate(&self, registration: &Registration) -> Result<Authenticated>;
}

/// Accepts every peer presenting one shared token
///
/// Hosts keep the id they register with; control clients are numbered from 1
/// in registration order.
#[derive(Debug)]
pub struct TokenAuthenticator {
    token: String,
    next_control_id: AtomicU32,
}

impl TokenAuthenticator {
    /// Create an authenticator for `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            next_control_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, registration: &Registration) -> Result<Authenticated> {
        if registration.token() != self.token {
            return Err(LinkError::AuthenticationFailed("invalid token".to_string()));
        }
        let address = match registration {
            Registration::Host(host) => Address::host(host.id),
            Registration::Control(_) => {
                Address::control(self.next_control_id.fetch_add(1, Ordering::Relaxed))
            }
        };
        Ok(Authenticated {
            address,
            account: None,
        })
    }
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub enum Accepted {
    /// A peer registered; build a link over the new connector
    New {
        /// Connector for the new session
        connector: ServerConnector,
        /// What the peer registered with
        registration: Registration,
    },
    /// A peer resumed an existing session; its link keeps working
    Resumed(ServerConnector),
}

type SessionTable = DashMap<String, Weak<ServerShared>>;

/// Accepts sockets and runs the handshake
pub struct ServerEndpoint {
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    sessions: Arc<SessionTable>,
    plugins: BTreeMap<String, String>,
}

fn transport(e: TransportError) -> LinkError {
    LinkError::Transport(e.to_string())
}

fn mint_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

impl ServerEndpoint {
    /// Create an endpoint
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if `config` fails validation.
    pub fn new(config: ServerConfig, authenticator: impl Authenticator + 'static) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            authenticator: Arc::new(authenticator),
            sessions: Arc::new(DashMap::new()),
            plugins: BTreeMap::new(),
        })
    }

    /// Plugins announced in `hello`
    #[must_use]
    pub fn with_plugins(mut self, plugins: BTreeMap<String, String>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Number of sessions that can still be resumed or are connected
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the handshake on a freshly accepted socket
    ///
    /// # Errors
    ///
    /// - `LinkError::AuthenticationFailed` after closing the socket with 4003
    /// - `LinkError::InvalidMessage` after closing the socket with 1002
    /// - `LinkError::Timeout` if the peer does not register or resume in time
    /// - `LinkError::Transport` if the socket fails during the handshake
    pub async fn accept(&self, connection: Connection) -> Result<Accepted> {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let hello = Envelope::Hello(Hello {
            version: self.config.version.clone(),
            plugins: self.plugins.clone(),
        });
        sink.send_text(hello.to_frame(None)?.to_text()?)
            .await
            .map_err(transport)?;

        loop {
            let text = match tokio::time::timeout(
                self.config.handshake_timeout(),
                stream.next_frame(),
            )
            .await
            {
                Err(_) => {
                    close_quietly(&mut sink, CLOSE_PROTOCOL_ERROR, "Handshake timeout").await;
                    return Err(LinkError::timeout("peer did not complete the handshake"));
                }
                Ok(Some(Ok(Incoming::Text(text)))) => text,
                Ok(Some(Err(e))) => return Err(transport(e)),
                Ok(Some(Ok(Incoming::Closed(_))) | None) => {
                    return Err(LinkError::Transport(
                        "socket closed during handshake".to_string(),
                    ));
                }
            };

            let envelope = match Frame::parse(&text).and_then(|frame| Envelope::from_frame(&frame))
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Invalid handshake frame: {}", e);
                    close_quietly(&mut sink, CLOSE_PROTOCOL_ERROR, "Invalid handshake").await;
                    return Err(e);
                }
            };

            match envelope {
                Envelope::RegisterHost(register) => {
                    return self
                        .register(Registration::Host(register), Connection::new(sink, stream))
                        .await;
                }
                Envelope::RegisterControl(register) => {
                    return self
                        .register(Registration::Control(register), Connection::new(sink, stream))
                        .await;
                }
                Envelope::Resume(resume) => {
                    let known = self
                        .sessions
                        .get(&resume.session_token)
                        .and_then(|entry| entry.upgrade());
                    let mut connection = Connection::new(sink, stream);
                    if let Some(shared) = known {
                        match shared.resume(connection, resume.last_seq).await {
                            Ok(()) => return Ok(Accepted::Resumed(ServerConnector { shared })),
                            Err(returned) => connection = returned,
                        }
                    }

                    tracing::info!("Unknown or expired session token, invalidating");
                    let invalidate = Envelope::Invalidate.to_frame(None)?.to_text()?;
                    connection
                        .sink
                        .send_text(invalidate)
                        .await
                        .map_err(transport)?;
                    Connection { sink, stream } = connection;
                }
                other => {
                    let reason = format!("unexpected {} during handshake", other.kind());
                    tracing::warn!("{}", reason);
                    close_quietly(&mut sink, CLOSE_PROTOCOL_ERROR, &reason).await;
                    return Err(LinkError::InvalidMessage(reason.into()));
                }
            }
        }
    }

    async fn register(
        &self,
        registration: Registration,
        mut connection: Connection,
    ) -> Result<Accepted> {
        let auth = match self.authenticator.authenticate(&registration).await {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(code = CLOSE_AUTH_FAILED, "Authentication failed: {}", e);
                close_quietly(&mut connection.sink, CLOSE_AUTH_FAILED, "Authentication failed")
                    .await;
                return Err(match e {
                    LinkError::AuthenticationFailed(reason) => {
                        LinkError::AuthenticationFailed(reason)
                    }
                    other => LinkError::AuthenticationFailed(other.to_string()),
                });
            }
        };

        let token = mint_token();
        let shared = Arc::new(ServerShared {
            token: token.clone(),
            dst: auth.address,
            config: self.config.clone(),
            sessions: Arc::downgrade(&self.sessions),
            notifier: Notifier::new(),
            state: Mutex::new(ServerState {
                phase: ConnectorState::Handshake,
                session: SessionCore::new(),
                generation: 0,
                expiry: None,
            }),
        });
        self.sessions.insert(token.clone(), Arc::downgrade(&shared));

        let ready = Envelope::Ready(Ready {
            src: auth.address,
            session_token: token,
            session_timeout: self.config.session_timeout_secs,
            heartbeat_interval: self.config.heartbeat_interval_secs,
            account: auth.account,
        });
        shared.establish(connection, &ready).await;

        tracing::info!("Registered {}", auth.address);
        Ok(Accepted::New {
            connector: ServerConnector { shared },
            registration,
        })
    }
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

async fn close_quietly(sink: &mut Box<dyn FrameSink>, code: u16, reason: &str) {
    if let Err(e) = sink.close(CloseFrame::new(code, reason)).await {
        tracing::debug!("Close failed: {}", e);
    }
}

struct ServerState {
    phase: ConnectorState,
    session: SessionCore,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

struct ServerShared {
    token: String,
    dst: Address,
    config: ServerConfig,
    sessions: Weak<SessionTable>,
    notifier: Notifier,
    state: Mutex<ServerState>,
}

/// Accept side connector for one registered peer
///
/// `Handshake` here means the session is detached: its socket was lost and
/// it is waiting to be resumed.
#[derive(Clone)]
pub struct ServerConnector {
    shared: Arc<ServerShared>,
}

impl ServerConnector {
    /// Session token issued to the peer
    #[must_use]
    pub fn session_token(&self) -> &str {
        &self.shared.token
    }

    /// Sequence number the next send will be assigned
    pub async fn next_seq(&self) -> u64 {
        self.shared.state.lock().await.session.next_seq()
    }

    /// Sequence numbers still awaiting acknowledgement
    pub async fn unacknowledged(&self) -> Vec<u64> {
        self.shared.state.lock().await.session.send_buffer().seqs()
    }

    /// Drop the current socket without a close handshake
    pub async fn abort_socket(&self) {
        let mut state = self.shared.state.lock().await;
        if state.session.is_attached() {
            tracing::debug!("Aborting socket to {}", self.shared.dst);
            self.shared.socket_lost(&mut state);
        }
    }
}

impl std::fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnector")
            .field("peer", &self.shared.dst)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for ServerConnector {
    fn src(&self) -> Address {
        Address::controller()
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
                Err(LinkError::session_lost("session is closed"))
            }
            ConnectorState::Handshake => state.session.push_routable(&envelope, false),
            ConnectorState::Connected | ConnectorState::Closing => {
                state.session.push_routable(&envelope, true)
            }
        }
    }

    async fn send_disconnect(&self, phase: DisconnectPhase) -> Result<()> {
        let state = self.shared.state.lock().await;
        if state.session.send_unsequenced(&Envelope::Disconnect(phase))? {
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
            tracing::debug!("Session with {} closing", self.shared.dst);
            state.phase = ConnectorState::Closing;
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut state = self.shared.state.lock().await;
        if matches!(state.phase, ConnectorState::New | ConnectorState::Closed) {
            return;
        }
        tracing::info!(code, "Closing session with {}: {}", self.shared.dst, reason);
        state.session.close_socket(code, reason);
        state.generation += 1;
        self.shared.finish(&mut state);
    }
}

impl ServerShared {
    fn attach(self: &Arc<Self>, state: &mut ServerState, connection: Connection) {
        state.generation += 1;
        state.session.attach(spawn_writer(connection.sink));
        spawn_reader(Arc::downgrade(self), state.generation, connection.stream);
    }

    fn start_heartbeat(self: &Arc<Self>, state: &mut ServerState) {
        let interval = self.config.heartbeat_interval();
        let task = spawn_heartbeat(Arc::downgrade(self), state.generation, interval);
        state.session.start_heartbeat(interval, task);
    }

    /// Attach the first socket and send `ready`
    async fn establish(self: &Arc<Self>, connection: Connection, ready: &Envelope) {
        let mut state = self.state.lock().await;
        self.attach(&mut state, connection);
        if let Err(e) = state.session.send_unsequenced(ready) {
            tracing::warn!("Failed to encode ready: {}", e);
        }
        state.phase = ConnectorState::Connected;
        self.start_heartbeat(&mut state);
    }

    /// Attach a resuming socket, send `continue` and replay
    ///
    /// Hands the connection back if the session already ended.
    async fn resume(
        self: &Arc<Self>,
        connection: Connection,
        client_last_seq: Option<u64>,
    ) -> std::result::Result<(), Connection> {
        let mut state = self.state.lock().await;
        if matches!(state.phase, ConnectorState::New | ConnectorState::Closed) {
            return Err(connection);
        }
        if let Some(expiry) = state.expiry.take() {
            expiry.abort();
        }
        if state.session.is_attached() {
            tracing::debug!("{} resumed before its old socket was seen closing", self.dst);
            state.session.detach();
        }

        self.attach(&mut state, connection);
        let cont = Envelope::Continue(Continue {
            session_timeout: self.config.session_timeout_secs,
            heartbeat_interval: self.config.heartbeat_interval_secs,
            last_seq: state.session.last_received_seq(),
        });
        if let Err(e) = state.session.send_unsequenced(&cont) {
            tracing::warn!("Failed to encode continue: {}", e);
        }
        if let Some(ack) = client_last_seq {
            state.session.acknowledge(ack);
        }
        state.session.flush();
        state.phase = ConnectorState::Connected;
        self.start_heartbeat(&mut state);

        tracing::info!(
            replayed = state.session.send_buffer().len(),
            "Resumed session with {}",
            self.dst
        );
        self.notifier.emit(ConnectorEvent::Connect { resumed: true });
        Ok(())
    }

    fn protocol_error(self: &Arc<Self>, state: &mut ServerState, reason: &str) {
        tracing::warn!(
            code = CLOSE_PROTOCOL_ERROR,
            "Protocol violation from {}: {}",
            self.dst,
            reason
        );
        state.session.close_socket(CLOSE_PROTOCOL_ERROR, reason);
        self.notifier
            .emit(ConnectorEvent::Error(LinkError::InvalidMessage(
                reason.to_string().into(),
            )));
        self.socket_lost(state);
    }

    /// The socket is gone: detach and wait for a resume, or finish a close
    fn socket_lost(self: &Arc<Self>, state: &mut ServerState) {
        state.generation += 1;
        state.session.detach();

        match state.phase {
            ConnectorState::New | ConnectorState::Closed | ConnectorState::Handshake => {}
            ConnectorState::Closing => self.finish(state),
            ConnectorState::Connected => {
                let timeout = self.config.session_timeout();
                tracing::info!(
                    "Connection from {} dropped, keeping session for {:?}",
                    self.dst,
                    timeout
                );
                state.phase = ConnectorState::Handshake;
                self.notifier.emit(ConnectorEvent::Drop);

                let weak = Arc::downgrade(self);
                let generation = state.generation;
                state.expiry = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = weak.upgrade() {
                        let mut state = shared.state.lock().await;
                        if state.generation == generation
                            && state.phase == ConnectorState::Handshake
                        {
                            state.expiry = None;
                            tracing::info!("Session with {} expired", shared.dst);
                            shared.finish(&mut state);
                        }
                    }
                }));
            }
        }
    }

    /// End the session for good
    fn finish(&self, state: &mut ServerState) {
        if let Some(expiry) = state.expiry.take() {
            expiry.abort();
        }
        state.session.detach();
        state.session.reset();
        state.phase = ConnectorState::Closed;
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove(&self.token);
        }

        self.notifier.emit(ConnectorEvent::Close);
        self.notifier.push(Inbound::SessionLost);
    }
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove(&self.token);
        }
    }
}

#[async_trait]
impl SocketOwner for ServerShared {
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
        if matches!(
            state.phase,
            ConnectorState::Connected | ConnectorState::Closing
        ) {
            if let Err(reason) = handle_session_frame(&mut state.session, &self.notifier, frame) {
                self.protocol_error(&mut state, &reason);
            }
        }
    }

    async fn on_closed(self: Arc<Self>, generation: u64, frame: Option<CloseFrame>) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        tracing::debug!(
            code = frame.as_ref().map(|f| f.code),
            "Socket from {} closed",
            self.dst
        );
        self.socket_lost(&mut state);
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
                    code = CLOSE_HEARTBEAT_TIMEOUT,
                    "Heartbeat timeout from {}",
                    self.dst
                );
                state
                    .session
                    .close_socket(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout");
                self.socket_lost(&mut state);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::Peer;
    use serde_json::json;
    use std::time::Duration;
    use tether_core::NamedBody;
    use tether_transport::memory;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint::new(ServerConfig::default(), TokenAuthenticator::new("secret")).unwrap()
    }

    fn register_control(token: &str) -> Value {
        json!({ "token": token, "agent": "test", "version": "0.3.0" })
    }

    fn event(n: u64) -> Envelope {
        Envelope::Event(NamedBody {
            src: Address::controller(),
            dst: Address::control(1),
            name: "tick".to_string(),
            data: json!({ "n": n }),
        })
    }

    /// Register a control client; returns the scripted client and its connector
    async fn registered(endpoint: &ServerEndpoint) -> (Peer, ServerConnector, String) {
        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };
        let (accepted, token) = tokio::join!(endpoint.accept(server), async {
            assert_eq!(peer.recv().await.kind, "hello");
            peer.send("registerControl", register_control("secret")).await;
            let ready = peer.recv().await;
            assert_eq!(ready.kind, "ready");
            assert_eq!(ready.data["src"], json!([3, 1]));
            ready.data["sessionToken"].as_str().unwrap().to_string()
        });
        match accepted.unwrap() {
            Accepted::New { connector, .. } => (peer, connector, token),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_issues_token() {
        let endpoint = endpoint();
        let (_peer, connector, token) = registered(&endpoint).await;

        assert_eq!(token.len(), 32);
        assert_eq!(connector.session_token(), token);
        assert_eq!(connector.dst(), Address::control(1));
        assert_eq!(connector.src(), Address::controller());
        assert_eq!(connector.state().await, ConnectorState::Connected);
        assert_eq!(endpoint.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_token_closes_with_4003() {
        let endpoint = endpoint();
        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };

        let (accepted, frame) = tokio::join!(endpoint.accept(server), async {
            peer.recv().await;
            peer.send("registerControl", register_control("wrong")).await;
            peer.closed().await
        });

        assert!(matches!(accepted, Err(LinkError::AuthenticationFailed(_))));
        assert_eq!(frame.unwrap().code, CLOSE_AUTH_FAILED);
        assert_eq!(endpoint.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token_is_invalidated_then_registers() {
        let endpoint = endpoint();
        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };

        let (accepted, ()) = tokio::join!(endpoint.accept(server), async {
            peer.recv().await;
            peer.send("resume", json!({ "sessionToken": "stale", "lastSeq": null }))
                .await;
            assert_eq!(peer.recv().await.kind, "invalidate");
            peer.send("registerControl", register_control("secret")).await;
            assert_eq!(peer.recv().await.kind, "ready");
        });

        assert!(matches!(accepted, Ok(Accepted::New { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_and_replays() {
        let endpoint = endpoint();
        let (peer, connector, token) = registered(&endpoint).await;
        let mut events = connector.subscribe();

        drop(peer);
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Drop);
        for n in 1..=3 {
            connector.send(event(n)).await.unwrap();
        }

        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };
        let (accepted, ()) = tokio::join!(endpoint.accept(server), async {
            peer.recv().await;
            peer.send("resume", json!({ "sessionToken": token, "lastSeq": 1 }))
                .await;
            let cont = peer.recv().await;
            assert_eq!(cont.kind, "continue");
            assert_eq!(cont.data["lastSeq"], Value::Null);
            assert_eq!(peer.recv().await.seq, Some(2));
            assert_eq!(peer.recv().await.seq, Some(3));
        });

        assert!(matches!(accepted, Ok(Accepted::Resumed(_))));
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Connect { resumed: true }
        );
        assert_eq!(connector.state().await, ConnectorState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_session_expires() {
        let endpoint = endpoint();
        let (peer, connector, _token) = registered(&endpoint).await;
        let mut inbound = connector.take_inbound().unwrap();
        let mut events = connector.subscribe();

        drop(peer);
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Drop);

        tokio::time::sleep(ServerConfig::default().session_timeout() + Duration::from_secs(1))
            .await;
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Close);
        assert_eq!(inbound.recv().await, Some(Inbound::SessionLost));
        assert_eq!(connector.state().await, ConnectorState::Closed);
        assert_eq!(endpoint.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let endpoint = endpoint();
        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };

        let (accepted, frame) = tokio::join!(endpoint.accept(server), async {
            peer.recv().await;
            peer.closed().await
        });
        assert!(matches!(accepted, Err(LinkError::Timeout(_))));
        assert_eq!(frame.unwrap().code, CLOSE_PROTOCOL_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_frame_during_handshake_is_rejected() {
        let endpoint = endpoint();
        let (client, server) = memory::pair();
        let mut peer = Peer { conn: client };

        let (accepted, frame) = tokio::join!(endpoint.accept(server), async {
            peer.recv().await;
            peer.send("heartbeat", json!({ "seq": null })).await;
            peer.closed().await
        });
        assert!(matches!(accepted, Err(LinkError::InvalidMessage(_))));
        assert_eq!(frame.unwrap().code, CLOSE_PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_token_authenticator_numbers_controls() {
        let auth = TokenAuthenticator::new("secret");
        let control = Registration::Control(tether_core::RegisterControl {
            token: "secret".to_string(),
            agent: "a".to_string(),
            version: "1".to_string(),
        });
        assert_eq!(
            auth.authenticate(&control).await.unwrap().address,
            Address::control(1)
        );
        assert_eq!(
            auth.authenticate(&control).await.unwrap().address,
            Address::control(2)
        );
    }
}
