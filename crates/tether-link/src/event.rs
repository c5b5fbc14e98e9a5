//! Typed event descriptors
//!
//! Events travel one way and are never answered. An event declared with
//! `broadcast_to(BroadcastTarget::Instance)` is relayed down the tree: when
//! it arrives over one of the edges `instance-host`, `host-controller`,
//! `control-controller` or `controller-host` it is re-sent on every
//! downstream instance link except the one it came from, then handed to the
//! local handler if there is one.

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_core::envelope::event_key;
use tether_core::{Address, AddressType, Envelope, LinkError, Message, NamedBody, Result};

use crate::descriptor::{BroadcastTarget, LinkPair};
use crate::link::{self, Link};
use crate::registry::{Descriptor, DescriptorKind};

/// Where an event came from
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Link the event arrived on
    pub link: Link,
    /// Sender address
    pub src: Address,
    /// Address the event was sent to
    pub dst: Address,
}

/// Boxed event handler
pub type EventHandler<T> =
    Arc<dyn Fn(EventContext, T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

// Message pairs (sender-receiver) over which instance broadcasts are relayed
const BROADCAST_EDGES: [LinkPair; 4] = [
    LinkPair::new(AddressType::Instance, AddressType::Host),
    LinkPair::new(AddressType::Host, AddressType::Controller),
    LinkPair::new(AddressType::Control, AddressType::Controller),
    LinkPair::new(AddressType::Controller, AddressType::Host),
];

/// Typed event descriptor
pub struct Event<T> {
    name: Cow<'static, str>,
    links: Vec<LinkPair>,
    broadcast_to: Option<BroadcastTarget>,
    default_handler: Option<EventHandler<T>>,
    _type: PhantomData<fn(T)>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            links: self.links.clone(),
            broadcast_to: self.broadcast_to,
            default_handler: self.default_handler.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("links", &self.links)
            .field("broadcast_to", &self.broadcast_to)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Event`]
pub struct EventBuilder<T> {
    name: Cow<'static, str>,
    links: Vec<String>,
    broadcast_to: Option<BroadcastTarget>,
    default_handler: Option<EventHandler<T>>,
}

impl<T> EventBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Link pairs (`"source-target"`) the event may be sent over
    #[must_use]
    pub fn links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.extend(links.into_iter().map(Into::into));
        self
    }

    /// Relay the event down the tree
    #[must_use]
    pub fn broadcast_to(mut self, target: BroadcastTarget) -> Self {
        self.broadcast_to = Some(target);
        self
    }

    /// Handler installed by [`Event::attach_default`]
    #[must_use]
    pub fn default_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(EventContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.default_handler = Some(boxed(f));
        self
    }

    /// Finish the descriptor
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if no links are given or a link
    /// pair does not parse.
    pub fn build(self) -> Result<Event<T>> {
        if self.links.is_empty() {
            return Err(LinkError::InvalidConfig(
                format!("event {} has no links", self.name).into(),
            ));
        }
        let links = self
            .links
            .iter()
            .map(|pair| pair.parse())
            .collect::<Result<Vec<LinkPair>>>()?;
        Ok(Event {
            name: self.name,
            links,
            broadcast_to: self.broadcast_to,
            default_handler: self.default_handler,
            _type: PhantomData,
        })
    }
}

fn boxed<T, F, Fut>(f: F) -> EventHandler<T>
where
    F: Fn(EventContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: EventContext, event: T| -> BoxFuture<'static, Result<()>> {
        Box::pin(f(ctx, event))
    })
}

impl<T> Event<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start building a descriptor for `name`
    pub fn builder(name: impl Into<Cow<'static, str>>) -> EventBuilder<T> {
        EventBuilder {
            name: name.into(),
            links: Vec::new(),
            broadcast_to: None,
            default_handler: None,
        }
    }

    /// Event name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if `link` may send this event
    #[must_use]
    pub fn is_sender(&self, link: &Link) -> bool {
        self.links.contains(&link.pair())
    }

    /// Returns true if `link` may receive this event
    #[must_use]
    pub fn is_receiver(&self, link: &Link) -> bool {
        self.links.contains(&link.pair().reversed())
    }

    fn relays(&self, link: &Link) -> bool {
        self.broadcast_to == Some(BroadcastTarget::Instance)
            && BROADCAST_EDGES.contains(&link.pair().reversed())
    }

    /// Handle the event on `link` with `handler`
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if `link` is not a receiving side
    /// of this event or already has a handler for it.
    pub fn attach<F, Fut>(&self, link: &Link, handler: F) -> Result<()>
    where
        F: Fn(EventContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.install(link, Some(boxed(handler)))
    }

    /// Handle the event on `link` with the default handler, relaying it if
    /// it is broadcast
    ///
    /// Does nothing on a link that only sends this event.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if `link` receives this event but
    /// there is neither a default handler nor a relay on this edge.
    pub fn attach_default(&self, link: &Link) -> Result<()> {
        if !self.is_receiver(link) {
            return self.check_sender(link);
        }
        if self.default_handler.is_none() && !self.relays(link) {
            return Err(LinkError::InvalidState(
                format!("event {} has no default handler", self.name).into(),
            ));
        }
        self.install(link, self.default_handler.clone())
    }

    fn check_sender(&self, link: &Link) -> Result<()> {
        if self.is_sender(link) {
            Ok(())
        } else {
            Err(LinkError::InvalidState(
                format!("event {} is not valid on {} links", self.name, link.pair()).into(),
            ))
        }
    }

    fn install(&self, link: &Link, handler: Option<EventHandler<T>>) -> Result<()> {
        if !self.is_receiver(link) {
            return Err(LinkError::InvalidState(
                format!("event {} is not received on {} links", self.name, link.pair()).into(),
            ));
        }

        let key = event_key(&self.name);
        if !link.has_validator(&key) {
            link.set_validator(
                key.clone(),
                link::validator(|message: &Message| validate_event::<T>(message)),
            )?;
        }

        let descriptor = self.clone();
        let relay = self.relays(link);
        link.set_handler(
            key,
            link::handler(move |link, message| {
                let descriptor = descriptor.clone();
                let handler = handler.clone();
                async move { descriptor.deliver(link, message, relay, handler).await }
            }),
        )
    }

    async fn deliver(
        &self,
        link: Link,
        message: Message,
        relay: bool,
        handler: Option<EventHandler<T>>,
    ) -> Result<()> {
        let Envelope::Event(body) = message.envelope else {
            return Err(LinkError::invalid_message("not an event"));
        };

        if relay {
            self.relay(&link, &body).await;
        }

        if let Some(handler) = handler {
            let event: T = decode(&body.name, body.data)?;
            let ctx = EventContext {
                link,
                src: body.src,
                dst: body.dst,
            };
            handler(ctx, event).await?;
        }
        Ok(())
    }

    async fn relay(&self, origin: &Link, body: &NamedBody) {
        let Some(router) = origin.router() else {
            tracing::warn!("Cannot relay event {} without a router", self.name);
            return;
        };
        for next in router.downstream_instance_links() {
            if next.ptr_eq(origin) {
                continue;
            }
            let envelope = Envelope::Event(NamedBody {
                src: body.src,
                dst: Address::broadcast(AddressType::Instance),
                name: body.name.clone(),
                data: body.data.clone(),
            });
            if let Err(e) = next.send(envelope).await {
                tracing::debug!("Could not relay event {} to {}: {}", self.name, next.dst(), e);
            }
        }
    }

    /// Send the event to the peer of `link`
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if `link` may not send this event
    /// and `LinkError::SessionLost` if there is no session.
    pub async fn send(&self, link: &Link, event: &T) -> Result<()> {
        self.send_to(link, link.dst(), event).await
    }

    /// Send the event to `dst` over `link`
    ///
    /// # Errors
    ///
    /// See [`Event::send`].
    pub async fn send_to(&self, link: &Link, dst: Address, event: &T) -> Result<()> {
        self.check_sender(link)?;
        link.send(Envelope::Event(NamedBody {
            src: link.src(),
            dst,
            name: self.name.to_string(),
            data: serde_json::to_value(event)?,
        }))
        .await?;
        Ok(())
    }
}

impl<T> Descriptor for Event<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Event
    }

    fn links(&self) -> &[LinkPair] {
        &self.links
    }

    fn attach_defaults(&self, link: &Link) -> Result<()> {
        if self.is_receiver(link) && (self.default_handler.is_some() || self.relays(link)) {
            self.attach_default(link)
        } else {
            Ok(())
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| LinkError::InvalidMessage(format!("invalid {name} payload: {e}").into()))
}

fn validate_event<T: DeserializeOwned>(message: &Message) -> Result<()> {
    match &message.envelope {
        Envelope::Event(body) => decode::<T>(&body.name, body.data.clone()).map(|_| ()),
        _ => Err(LinkError::invalid_message("not an event")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::MockConnector;
    use crate::router::StaticRouter;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    fn chat() -> Event<Chat> {
        Event::builder("chat")
            .links(["control-controller", "controller-host", "host-instance"])
            .broadcast_to(BroadcastTarget::Instance)
            .build()
            .unwrap()
    }

    fn link(src: Address, dst: Address) -> (Link, Arc<MockConnector>) {
        let connector = MockConnector::new(src, dst);
        let link = Link::new(LinkPair::new(src.kind(), dst.kind()), connector.clone()).unwrap();
        (link, connector)
    }

    fn chat_frame(src: Address, text: &str) -> tether_core::Frame {
        Envelope::Event(NamedBody {
            src,
            dst: Address::broadcast(AddressType::Instance),
            name: "chat".into(),
            data: json!({ "text": text }),
        })
        .to_frame(Some(1))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_receives_event() {
        let (link, _connector) = link(Address::instance(1), Address::host(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        chat()
            .attach(&link, move |_ctx, event: Chat| {
                let tx = tx.clone();
                async move {
                    tx.send(event.text).unwrap();
                    Ok(())
                }
            })
            .unwrap();

        link.process_message(chat_frame(Address::host(1), "hello"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_relays_to_hosts() {
        let (from_control, _control) = link(Address::controller(), Address::control(1));
        let (to_host_a, host_a) = link(Address::controller(), Address::host(1));
        let (to_host_b, host_b) = link(Address::controller(), Address::host(2));

        let router = Arc::new(StaticRouter::new());
        router.add_route(Address::instance(10), to_host_a.clone());
        router.add_route(Address::instance(20), to_host_b.clone());
        from_control.set_router(router).unwrap();

        chat().attach_default(&from_control).unwrap();
        from_control
            .process_message(chat_frame(Address::control(1), "hi all"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for host in [host_a, host_b] {
            match host.sent().as_slice() {
                [Envelope::Event(body)] => {
                    assert_eq!(body.src, Address::control(1));
                    assert_eq!(body.dst, Address::broadcast(AddressType::Instance));
                    assert_eq!(body.data, json!({ "text": "hi all" }));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_skips_origin() {
        let (from_instance, instance) = link(Address::host(1), Address::instance(10));
        let (to_other, other) = link(Address::host(1), Address::instance(11));

        let event: Event<Chat> = Event::builder("chat")
            .links(["instance-host"])
            .broadcast_to(BroadcastTarget::Instance)
            .build()
            .unwrap();

        let router = Arc::new(StaticRouter::new());
        router.add_route(Address::instance(10), from_instance.clone());
        router.add_route(Address::instance(11), to_other.clone());
        from_instance.set_router(router).unwrap();

        event.attach_default(&from_instance).unwrap();
        from_instance
            .process_message(chat_frame(Address::instance(10), "up"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(instance.sent().is_empty());
        assert_eq!(other.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_default_without_handler_fails() {
        let event: Event<Chat> = Event::builder("chat").links(["host-controller"]).build().unwrap();
        let (controller, _connector) = link(Address::controller(), Address::host(1));
        assert!(matches!(
            event.attach_default(&controller),
            Err(LinkError::InvalidState(_))
        ));
        // Registry attach skips descriptors with nothing to install
        assert!(event.attach_defaults(&controller).is_ok());
    }

    #[tokio::test]
    async fn test_send_checks_direction() {
        let (host, connector) = link(Address::host(1), Address::controller());
        let event: Event<Chat> = Event::builder("chat").links(["host-controller"]).build().unwrap();
        event
            .send(&host, &Chat { text: "x".into() })
            .await
            .unwrap();
        assert_eq!(connector.sent().len(), 1);

        let (controller, _connector) = link(Address::controller(), Address::host(1));
        assert!(event.send(&controller, &Chat { text: "x".into() }).await.is_err());
    }
}
