//! Typed request descriptors
//!
//! A [`Request`] names a request type, the link pairs it may travel over and
//! how the receiving side handles it. Attaching it to a [`Link`] installs the
//! validator and handler for `request:<name>`; [`Request::send`] issues one
//! request and awaits its `response` / `responseError`.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tether_link::{Link, Permission, Request};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Echo {
//!     text: String,
//! }
//!
//! # async fn run(client: Link, server: Link) -> tether_core::Result<()> {
//! let echo: Request<Echo, Echo> = Request::builder("echo")
//!     .links(["control-controller"])
//!     .permission(Permission::named("core.echo"))
//!     .build()?;
//!
//! echo.attach(&server, |_ctx, req: Echo| async move { Ok(req) })?;
//! let reply = echo.send(&client, &Echo { text: "hi".into() }).await?;
//! assert_eq!(reply.text, "hi");
//! # Ok(())
//! # }
//! ```

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::borrow::Cow;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_core::envelope::{RESPONSE_KEY, request_key};
use tether_core::{
    Address, AddressType, Envelope, ErrorData, LinkError, Message, NamedBody, ResponseBody,
    ResponseErrorBody, Result,
};

use crate::descriptor::{ForwardTarget, LinkPair, Permission};
use crate::link::{self, Link};
use crate::registry::{Descriptor, DescriptorKind};

/// Who sent a request and over which link
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Link the request arrived on
    pub link: Link,
    /// Requester address, including its request id
    pub src: Address,
    /// Address the request was sent to
    pub dst: Address,
    /// Sequence number of the request envelope
    pub seq: u64,
}

/// Boxed request handler
pub type RequestHandler<Req, Resp> =
    Arc<dyn Fn(RequestContext, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync>;

const CONTROL_CONTROLLER: LinkPair = LinkPair::new(AddressType::Control, AddressType::Controller);

/// Typed request descriptor
pub struct Request<Req, Resp> {
    name: Cow<'static, str>,
    links: Vec<LinkPair>,
    permission: Option<Permission>,
    forward_to: Option<ForwardTarget>,
    default_handler: Option<RequestHandler<Req, Resp>>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for Request<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            links: self.links.clone(),
            permission: self.permission.clone(),
            forward_to: self.forward_to,
            default_handler: self.default_handler.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Request<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("links", &self.links)
            .field("permission", &self.permission)
            .field("forward_to", &self.forward_to)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Request`]
pub struct RequestBuilder<Req, Resp> {
    name: Cow<'static, str>,
    links: Vec<String>,
    permission: Option<Permission>,
    forward_to: Option<ForwardTarget>,
    default_handler: Option<RequestHandler<Req, Resp>>,
}

impl<Req, Resp> RequestBuilder<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    /// Link pairs (`"source-target"`) the request may be sent over
    #[must_use]
    pub fn links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.extend(links.into_iter().map(Into::into));
        self
    }

    /// Permission checked for control clients
    #[must_use]
    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Forward the request instead of handling it locally
    #[must_use]
    pub fn forward_to(mut self, target: ForwardTarget) -> Self {
        self.forward_to = Some(target);
        self
    }

    /// Handler installed by [`Request::attach_default`]
    #[must_use]
    pub fn default_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.default_handler = Some(boxed(f));
        self
    }

    /// Finish the descriptor
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if no links are given, a link pair
    /// does not parse, or the permission is missing on a
    /// `control-controller` request (or present on any other).
    pub fn build(self) -> Result<Request<Req, Resp>> {
        if self.links.is_empty() {
            return Err(LinkError::InvalidConfig(
                format!("request {} has no links", self.name).into(),
            ));
        }
        let links = self
            .links
            .iter()
            .map(|pair| pair.parse())
            .collect::<Result<Vec<LinkPair>>>()?;

        let from_control = links.contains(&CONTROL_CONTROLLER);
        match (&self.permission, from_control) {
            (None, true) => {
                return Err(LinkError::InvalidConfig(
                    format!("request {} must declare a permission", self.name).into(),
                ));
            }
            (Some(_), false) => {
                return Err(LinkError::InvalidConfig(
                    format!(
                        "request {} is not sent by control clients and cannot have a permission",
                        self.name
                    )
                    .into(),
                ));
            }
            _ => {}
        }

        Ok(Request {
            name: self.name,
            links,
            permission: self.permission,
            forward_to: self.forward_to,
            default_handler: self.default_handler,
            _types: PhantomData,
        })
    }
}

fn boxed<Req, Resp, F, Fut>(f: F) -> RequestHandler<Req, Resp>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext, req: Req| -> BoxFuture<'static, Result<Resp>> {
        Box::pin(f(ctx, req))
    })
}

enum Responder<Req, Resp> {
    Handler(RequestHandler<Req, Resp>),
    Forward(ForwardTarget),
}

impl<Req, Resp> Clone for Responder<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Responder::Handler(h) => Responder::Handler(Arc::clone(h)),
            Responder::Forward(t) => Responder::Forward(*t),
        }
    }
}

impl<Req, Resp> Request<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start building a descriptor for `name`
    pub fn builder(name: impl Into<Cow<'static, str>>) -> RequestBuilder<Req, Resp> {
        RequestBuilder {
            name: name.into(),
            links: Vec::new(),
            permission: None,
            forward_to: None,
            default_handler: None,
        }
    }

    /// Request name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link pairs the request may travel over
    #[must_use]
    pub fn links(&self) -> &[LinkPair] {
        &self.links
    }

    /// Declared permission
    #[must_use]
    pub fn permission(&self) -> Option<&Permission> {
        self.permission.as_ref()
    }

    /// Returns true if `link` may send this request
    #[must_use]
    pub fn is_sender(&self, link: &Link) -> bool {
        self.links.contains(&link.pair())
    }

    /// Returns true if `link` may receive this request
    #[must_use]
    pub fn is_receiver(&self, link: &Link) -> bool {
        self.links.contains(&link.pair().reversed())
    }

    /// Handle the request on `link` with `handler`
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if `link` is not a receiving side
    /// of this request or already has a handler for it.
    pub fn attach<F, Fut>(&self, link: &Link, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.install(link, Responder::Handler(boxed(handler)))
    }

    /// Handle the request on `link` with the default handler or forwarder
    ///
    /// Does nothing on a link that only sends this request.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if `link` receives this request but
    /// neither a default handler nor a forward target is declared.
    pub fn attach_default(&self, link: &Link) -> Result<()> {
        if !self.is_receiver(link) {
            return self.check_sender(link);
        }
        let responder = match (&self.default_handler, self.forward_to) {
            (Some(handler), _) => Responder::Handler(Arc::clone(handler)),
            (None, Some(target)) => Responder::Forward(target),
            (None, None) => {
                return Err(LinkError::InvalidState(
                    format!("request {} has no default handler", self.name).into(),
                ));
            }
        };
        self.install(link, responder)
    }

    fn has_default(&self) -> bool {
        self.default_handler.is_some() || self.forward_to.is_some()
    }

    fn check_sender(&self, link: &Link) -> Result<()> {
        if self.is_sender(link) {
            Ok(())
        } else {
            Err(LinkError::InvalidState(
                format!("request {} is not valid on {} links", self.name, link.pair()).into(),
            ))
        }
    }

    fn install(&self, link: &Link, responder: Responder<Req, Resp>) -> Result<()> {
        if !self.is_receiver(link) {
            return Err(LinkError::InvalidState(
                format!("request {} is not received on {} links", self.name, link.pair()).into(),
            ));
        }

        let key = request_key(&self.name);
        if !link.has_validator(&key) {
            let requires_instance = self.forward_to == Some(ForwardTarget::Instance);
            link.set_validator(
                key.clone(),
                link::validator(move |message: &Message| {
                    validate_request::<Req>(message, requires_instance)
                }),
            )?;
        }

        let descriptor = self.clone();
        link.set_handler(
            key,
            link::handler(move |link, message| {
                let descriptor = descriptor.clone();
                let responder = responder.clone();
                async move { descriptor.respond(link, message, responder).await }
            }),
        )
    }

    async fn respond(
        &self,
        link: Link,
        message: Message,
        responder: Responder<Req, Resp>,
    ) -> Result<()> {
        let Envelope::Request(body) = &message.envelope else {
            return Err(LinkError::invalid_message("not a request"));
        };
        let ctx = RequestContext {
            link: link.clone(),
            src: body.src,
            dst: body.dst,
            seq: message.seq,
        };

        let reply = match self.run(ctx, body.data.clone(), responder).await {
            Ok(data) => Envelope::Response(ResponseBody {
                src: body.dst,
                dst: body.src,
                data,
            }),
            Err(err) => {
                match &err {
                    LinkError::Request { .. } | LinkError::Permission(_) => {
                        tracing::debug!("Request {} failed: {}", self.name, err);
                    }
                    _ => tracing::warn!("Request {} failed: {}", self.name, err),
                }
                Envelope::ResponseError(ResponseErrorBody {
                    src: body.dst,
                    dst: body.src,
                    data: ErrorData::from(&err),
                })
            }
        };
        link.send(reply).await?;
        Ok(())
    }

    async fn run(
        &self,
        ctx: RequestContext,
        data: Value,
        responder: Responder<Req, Resp>,
    ) -> Result<Value> {
        if ctx.link.pair() == CONTROL_CONTROLLER.reversed() {
            if let Some(Permission::Named(permission)) = &self.permission {
                ctx.link.check_permission(permission)?;
            }
        }

        match responder {
            Responder::Handler(handler) => {
                let request: Req = decode(&self.name, data)?;
                let response = handler(ctx, request).await?;
                Ok(serde_json::to_value(response)?)
            }
            Responder::Forward(target) => self.forward(&ctx.link, target, data).await,
        }
    }

    async fn forward(&self, origin: &Link, target: ForwardTarget, data: Value) -> Result<Value> {
        let dst = match target {
            ForwardTarget::Instance => {
                let id = instance_id(&data).ok_or_else(|| {
                    LinkError::invalid_message("forwarded request is missing instanceId")
                })?;
                Address::instance(id)
            }
            ForwardTarget::Controller => Address::controller(),
        };
        let next = origin
            .router()
            .and_then(|router| router.route(&dst))
            .ok_or_else(|| LinkError::Request {
                message: format!("No route to {dst}"),
                code: Some("NoRoute".to_string()),
                stack: None,
            })?;
        tracing::trace!("Forwarding request {} to {}", self.name, dst);
        self.send_raw(&next, dst, data).await
    }

    /// Send a request to the peer of `link` and await the response
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Request` if the remote handler failed,
    /// `LinkError::SessionLost` if the session ended before the response
    /// arrived and `LinkError::InvalidState` if `link` may not send this
    /// request.
    pub async fn send(&self, link: &Link, request: &Req) -> Result<Resp> {
        self.send_to(link, link.dst(), request).await
    }

    /// Send a request to `dst` over `link` and await the response
    ///
    /// # Errors
    ///
    /// See [`Request::send`].
    pub async fn send_to(&self, link: &Link, dst: Address, request: &Req) -> Result<Resp> {
        self.check_sender(link)?;
        let data = serde_json::to_value(request)?;
        if self.forward_to == Some(ForwardTarget::Instance) && instance_id(&data).is_none() {
            return Err(LinkError::invalid_message("request is missing instanceId"));
        }
        let value = self.send_raw(link, dst, data).await?;
        decode(&self.name, value)
    }

    async fn send_raw(&self, link: &Link, dst: Address, data: Value) -> Result<Value> {
        let src = link.src().with_request_id(link.next_request_id());
        let response = link.wait_for(RESPONSE_KEY, json!({ "dst": src }));
        link.send(Envelope::Request(NamedBody {
            src,
            dst,
            name: self.name.to_string(),
            data,
        }))
        .await?;

        let message = response.await?;
        match message.envelope {
            Envelope::Response(body) => Ok(body.data),
            Envelope::ResponseError(body) => Err(body.data.into()),
            _ => Err(LinkError::invalid_message("unexpected reply to request")),
        }
    }
}

impl<Req, Resp> Descriptor for Request<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Request
    }

    fn links(&self) -> &[LinkPair] {
        &self.links
    }

    fn attach_defaults(&self, link: &Link) -> Result<()> {
        if self.is_receiver(link) && self.has_default() {
            self.attach_default(link)
        } else {
            Ok(())
        }
    }
}

fn instance_id(data: &Value) -> Option<u32> {
    data.get("instanceId")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}

fn decode<T: DeserializeOwned>(name: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| LinkError::InvalidMessage(format!("invalid {name} payload: {e}").into()))
}

fn validate_request<Req: DeserializeOwned>(message: &Message, requires_instance: bool) -> Result<()> {
    let Envelope::Request(body) = &message.envelope else {
        return Err(LinkError::invalid_message("not a request"));
    };
    if requires_instance && instance_id(&body.data).is_none() {
        return Err(LinkError::invalid_message("request is missing instanceId"));
    }
    // Forwarded requests are only checked for instanceId, the final
    // receiver decodes them fully.
    if !requires_instance {
        decode::<Req>(&body.name, body.data.clone())?;
    }
    Ok(())
}
