//! Links: dispatch of inbound routable envelopes.
//!
//! A [`Link`] sits on one [`Connector`] and keeps three tables keyed by
//! dispatch key (`request:<name>`, `event:<name>` or `response`):
//!
//! - validators, exactly one per key, required before anything can be
//!   dispatched or awaited under that key
//! - handlers, at most one per key
//! - waiters, one-shot matchers resolved by the first inbound envelope whose
//!   body contains every field of their match object
//!
//! Every inbound envelope must reach a handler or a waiter; anything else is
//! an `InvalidMessage`. When the session is lost every waiter fails with
//! `SessionLost`, so in-flight requests never outlive their session.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use dashmap::DashMap;
use tether_core::envelope::RESPONSE_KEY;
use tether_core::{
    Address, CLOSE_NORMAL, DisconnectPhase, Envelope, ErrorData, Frame, LinkError, Message,
    ResponseErrorBody, Result,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::connector::{Connector, Inbound};
use crate::descriptor::{LinkPair, PermissionCheck};
use crate::router::Router;

/// Future returned by a handler
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Handles every inbound envelope under one dispatch key
pub type Handler = Arc<dyn Fn(Link, Message) -> HandlerFuture + Send + Sync>;

/// Accepts or rejects an inbound envelope before dispatch
pub type Validator = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Box an async function as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Link, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |link: Link, message: Message| -> HandlerFuture { Box::pin(f(link, message)) })
}

/// Wrap a function as a [`Validator`]
pub fn validator<F>(f: F) -> Validator
where
    F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Waiter {
    id: u64,
    data_match: Map<String, Value>,
    tx: oneshot::Sender<Result<Message>>,
    // Dropped when the waiter is resolved, rejected or abandoned
    done: watch::Sender<()>,
}

impl Waiter {
    fn matches(&self, body: &Value) -> bool {
        self.data_match
            .iter()
            .all(|(key, expected)| body.get(key) == Some(expected))
    }
}

/// Removes an abandoned waiter when its future is dropped
struct WaiterGuard {
    link: Weak<LinkInner>,
    key: String,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.link.upgrade() {
            if let Some(mut waiters) = inner.waiters.get_mut(&self.key) {
                waiters.retain(|waiter| waiter.id != self.id);
            }
        }
    }
}

struct LinkInner {
    pair: LinkPair,
    connector: Arc<dyn Connector>,
    validators: DashMap<String, Validator>,
    handlers: DashMap<String, Handler>,
    waiters: DashMap<String, Vec<Waiter>>,
    next_waiter_id: AtomicU64,
    next_request_id: AtomicU32,
    router: OnceLock<Arc<dyn Router>>,
    permissions: OnceLock<Arc<dyn PermissionCheck>>,
}

/// Typed message dispatch over one connector
///
/// Cheap to clone; all clones share the same tables.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Create a link and start dispatching the connector's inbound frames
    ///
    /// `pair` names our side first: a control client's link to the
    /// controller is `control-controller`, the controller's link back to it
    /// is `controller-control`.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if another link already took the
    /// connector's inbound channel.
    pub fn new(pair: LinkPair, connector: Arc<dyn Connector>) -> Result<Self> {
        let inbound = connector
            .take_inbound()
            .ok_or(LinkError::invalid_state("connector is already in use by a link"))?;

        let link = Self {
            inner: Arc::new(LinkInner {
                pair,
                connector,
                validators: DashMap::new(),
                handlers: DashMap::new(),
                waiters: DashMap::new(),
                next_waiter_id: AtomicU64::new(1),
                next_request_id: AtomicU32::new(1),
                router: OnceLock::new(),
                permissions: OnceLock::new(),
            }),
        };
        link.set_validator(RESPONSE_KEY, validator(validate_response))?;
        spawn_dispatch(Arc::downgrade(&link.inner), inbound);
        Ok(link)
    }

    /// Source and target type of this link
    #[must_use]
    pub fn pair(&self) -> LinkPair {
        self.inner.pair
    }

    /// Our own address
    #[must_use]
    pub fn src(&self) -> Address {
        self.inner.connector.src()
    }

    /// The peer's address
    #[must_use]
    pub fn dst(&self) -> Address {
        self.inner.connector.dst()
    }

    /// The underlying connector
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.inner.connector
    }

    /// Returns true if both handles refer to the same link
    #[must_use]
    pub fn ptr_eq(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Allocate a request id for an outbound request
    pub fn next_request_id(&self) -> u32 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a routable envelope through the connector
    ///
    /// # Errors
    ///
    /// See [`Connector::send`].
    pub async fn send(&self, envelope: Envelope) -> Result<u64> {
        self.inner.connector.send(envelope).await
    }

    /// Register the validator for a dispatch key
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if the key already has one.
    pub fn set_validator(&self, key: impl Into<String>, validator: Validator) -> Result<()> {
        let key = key.into();
        match self.inner.validators.entry(key) {
            dashmap::Entry::Occupied(entry) => Err(LinkError::InvalidState(
                format!("validator for {} is already registered", entry.key()).into(),
            )),
            dashmap::Entry::Vacant(entry) => {
                entry.insert(validator);
                Ok(())
            }
        }
    }

    /// Register the handler for a dispatch key
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if the key has no validator or
    /// already has a handler.
    pub fn set_handler(&self, key: impl Into<String>, handler: Handler) -> Result<()> {
        let key = key.into();
        if !self.has_validator(&key) {
            return Err(LinkError::InvalidState(
                format!("no validator registered for {key}").into(),
            ));
        }
        match self.inner.handlers.entry(key) {
            dashmap::Entry::Occupied(entry) => Err(LinkError::InvalidState(
                format!("handler for {} is already registered", entry.key()).into(),
            )),
            dashmap::Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Returns true if `key` has a validator
    #[must_use]
    pub fn has_validator(&self, key: &str) -> bool {
        self.inner.validators.contains_key(key)
    }

    /// Returns true if `key` has a handler
    #[must_use]
    pub fn has_handler(&self, key: &str) -> bool {
        self.inner.handlers.contains_key(key)
    }

    /// Install the router used for forwarding and broadcasts (once)
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if a router is already installed.
    pub fn set_router(&self, router: Arc<dyn Router>) -> Result<()> {
        self.inner
            .router
            .set(router)
            .map_err(|_| LinkError::invalid_state("router is already installed"))
    }

    /// Router installed on this link
    #[must_use]
    pub fn router(&self) -> Option<&Arc<dyn Router>> {
        self.inner.router.get()
    }

    /// Install the permission check for requests received on this link (once)
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if a check is already installed.
    pub fn set_permission_check(&self, check: Arc<dyn PermissionCheck>) -> Result<()> {
        self.inner
            .permissions
            .set(check)
            .map_err(|_| LinkError::invalid_state("permission check is already installed"))
    }

    /// Check a named permission for the peer of this link
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Permission` if the check denies it or no check is
    /// installed.
    pub fn check_permission(&self, permission: &str) -> Result<()> {
        match self.inner.permissions.get() {
            Some(check) => check.check_permission(permission),
            None => Err(LinkError::Permission(format!(
                "{permission} (no permission check installed)"
            ))),
        }
    }

    /// Wait for the first inbound envelope under `key` whose body contains
    /// every field of `data_match`
    ///
    /// The waiter is registered immediately, before the returned future is
    /// first polled. Dropping the future abandons the waiter.
    ///
    /// # Errors
    ///
    /// The future fails with `LinkError::InvalidState` if `key` has no
    /// validator or `data_match` is not an object, and with
    /// `LinkError::SessionLost` if the session ends first.
    pub fn wait_for(
        &self,
        key: impl Into<String>,
        data_match: Value,
    ) -> impl Future<Output = Result<Message>> + Send + 'static {
        let registered = self.register_waiter(key.into(), data_match);
        async move {
            let (rx, _guard) = registered?;
            rx.await
                .unwrap_or_else(|_| Err(LinkError::session_lost("link dropped")))
        }
    }

    fn register_waiter(
        &self,
        key: String,
        data_match: Value,
    ) -> Result<(oneshot::Receiver<Result<Message>>, WaiterGuard)> {
        if !self.has_validator(&key) {
            return Err(LinkError::InvalidState(
                format!("no validator registered for {key}").into(),
            ));
        }
        let data_match = match data_match {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(LinkError::invalid_state("waiter match must be an object")),
        };

        let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let (done, _) = watch::channel(());
        self.inner
            .waiters
            .entry(key.clone())
            .or_default()
            .push(Waiter {
                id,
                data_match,
                tx,
                done,
            });

        let guard = WaiterGuard {
            link: Arc::downgrade(&self.inner),
            key,
            id,
        };
        Ok((rx, guard))
    }

    /// Number of waiters still pending across all keys
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        self.inner.waiters.iter().map(|entry| entry.len()).sum()
    }

    /// Fail every pending waiter with `SessionLost` and clear the table
    pub fn reject_waiters(&self) {
        let keys: Vec<String> = self
            .inner
            .waiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut rejected = 0usize;
        for key in keys {
            if let Some((_, waiters)) = self.inner.waiters.remove(&key) {
                for waiter in waiters {
                    let _ = waiter
                        .tx
                        .send(Err(LinkError::session_lost("session lost")));
                    rejected += 1;
                }
            }
        }
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending waiters");
        }
    }

    fn resolve_waiters(&self, key: &str, message: &Message) -> usize {
        let Some(mut waiters) = self.inner.waiters.get_mut(key) else {
            return 0;
        };
        let body = message.body_value();
        let mut resolved = 0;
        let pending = std::mem::take(&mut *waiters);
        for waiter in pending {
            if waiter.matches(&body) {
                let _ = waiter.tx.send(Ok(message.clone()));
                resolved += 1;
            } else {
                waiters.push(waiter);
            }
        }
        resolved
    }

    /// Validate and dispatch one inbound routable frame
    ///
    /// Request-shaped frames that fail are answered with a `responseError`
    /// on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidMessage` if the frame is malformed, has no
    /// validator, fails validation, or reaches neither a handler nor a
    /// waiter.
    pub async fn process_message(&self, frame: Frame) -> Result<()> {
        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                if frame.is_request_shaped() {
                    let requester = frame
                        .data
                        .get("src")
                        .and_then(|src| serde_json::from_value::<Address>(src.clone()).ok());
                    if let Some(requester) = requester {
                        self.reply_error(requester, &e).await;
                    }
                }
                return Err(e);
            }
        };

        match self.dispatch(&message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Envelope::Request(body) = &message.envelope {
                    self.reply_error(body.src, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, message: &Message) -> Result<()> {
        let dst = message.dst();
        if !dst.is_broadcast() && dst.without_request_id() != self.src().without_request_id() {
            return self.forward(message).await;
        }

        let key = message.dispatch_key();
        let validator = self
            .inner
            .validators
            .get(&*key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                LinkError::InvalidMessage(format!("No validator for {key}").into())
            })?;
        validator(message)?;

        let handler = self
            .inner
            .handlers
            .get(&*key)
            .map(|entry| Arc::clone(entry.value()));
        let handled = handler.is_some();
        if let Some(handler) = handler {
            let future = handler(self.clone(), message.clone());
            let key = key.clone().into_owned();
            tokio::spawn(async move {
                if let Err(e) = future.await {
                    tracing::error!("Handler for {} failed: {}", key, e);
                }
            });
        }

        let resolved = self.resolve_waiters(&key, message);
        if !handled && resolved == 0 {
            return Err(LinkError::InvalidMessage(
                format!("Unhandled message {key}").into(),
            ));
        }
        Ok(())
    }

    async fn forward(&self, message: &Message) -> Result<()> {
        let dst = message.dst().without_request_id();
        let next = self
            .router()
            .and_then(|router| router.route(&dst))
            .ok_or_else(|| LinkError::InvalidMessage(format!("No route to {dst}").into()))?;
        tracing::trace!(seq = message.seq, "Forwarding {} to {}", message.envelope.kind(), dst);
        next.send(message.envelope.clone()).await?;
        Ok(())
    }

    async fn reply_error(&self, requester: Address, err: &LinkError) {
        let reply = Envelope::ResponseError(ResponseErrorBody {
            src: self.src(),
            dst: requester,
            data: ErrorData::from(err),
        });
        if let Err(e) = self.send(reply).await {
            tracing::debug!("Could not answer failed request: {}", e);
        }
    }

    /// Wait until every currently pending waiter has settled
    ///
    /// Waiters registered after the call are not waited for.
    pub async fn prepare_disconnect(&self) {
        let pending: Vec<watch::Receiver<()>> = self
            .inner
            .waiters
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|waiter| waiter.done.subscribe())
                    .collect::<Vec<_>>()
            })
            .collect();
        for mut done in pending {
            // Resolves once the waiter's sender is dropped
            let _ = done.changed().await;
        }
    }

    /// Ask the peer to drain and close
    ///
    /// # Errors
    ///
    /// Returns `LinkError::SessionLost` if there is no connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner
            .connector
            .send_disconnect(DisconnectPhase::Prepare)
            .await?;
        self.inner.connector.set_closing().await;
        Ok(())
    }

    /// Close the connector
    pub async fn close(&self, code: u16, reason: &str) {
        self.inner.connector.close(code, reason).await;
    }

    async fn on_disconnect_prepare(&self) {
        tracing::debug!("Peer is disconnecting, draining pending requests");
        self.prepare_disconnect().await;
        // Closing first, the peer closes the socket as soon as it sees ready
        self.inner.connector.set_closing().await;
        if let Err(e) = self
            .inner
            .connector
            .send_disconnect(DisconnectPhase::Ready)
            .await
        {
            tracing::debug!("Could not confirm disconnect: {}", e);
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("pair", &self.inner.pair)
            .field("validators", &self.inner.validators.len())
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

fn validate_response(message: &Message) -> Result<()> {
    match &message.envelope {
        Envelope::Response(body) if body.dst.request_id().is_some() => Ok(()),
        Envelope::ResponseError(body) if body.dst.request_id().is_some() => Ok(()),
        Envelope::Response(_) | Envelope::ResponseError(_) => Err(LinkError::invalid_message(
            "response destination carries no request id",
        )),
        _ => Err(LinkError::invalid_message("not a response")),
    }
}

fn spawn_dispatch(link: Weak<LinkInner>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    tokio::spawn(async move {
        while let Some(item) = inbound.recv().await {
            let Some(inner) = link.upgrade() else {
                break;
            };
            let link = Link { inner };
            match item {
                Inbound::Message(frame) => {
                    if let Err(e) = link.process_message(frame).await {
                        tracing::warn!("Rejected inbound message: {}", e);
                    }
                }
                Inbound::Disconnect(DisconnectPhase::Prepare) => {
                    tokio::spawn(async move { link.on_disconnect_prepare().await });
                }
                Inbound::Disconnect(DisconnectPhase::Ready) => {
                    link.close(CLOSE_NORMAL, "Disconnected").await;
                }
                Inbound::SessionLost => link.reject_waiters(),
            }
        }
    });
}
