//! # tether link
//!
//! Resumable peer sessions and typed message dispatch.
//!
//! - [`ClientConnector`] dials a peer, registers or resumes its session,
//!   keeps it alive with heartbeats and reconnects after drops, replaying
//!   anything the peer has not acknowledged.
//! - [`ServerEndpoint`] terminates the other end of that handshake and hands
//!   out [`ServerConnector`]s.
//! - [`Link`] dispatches the envelopes a connector delivers to validators,
//!   handlers and one-shot waiters.
//! - [`Request`] and [`Event`] describe typed messages and install
//!   themselves on links.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::{ConnectorConfig, RegisterControl, Registration};
//! use tether_link::{ClientConnector, Link, LinkPair, messages};
//! use tether_transport::WebSocketDialer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = WebSocketDialer::new("http://localhost:8080/")?;
//! let registration = Registration::Control(RegisterControl {
//!     token: "secret".into(),
//!     agent: "example".into(),
//!     version: tether_core::PROTOCOL_VERSION.into(),
//! });
//! let connector = ClientConnector::new(dialer, registration, ConnectorConfig::default())?;
//! connector.connect().await?;
//!
//! let link = Link::new("control-controller".parse::<LinkPair>()?, Arc::new(connector))?;
//! messages::ping()?.send(&link, &messages::Empty {}).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connector;
pub mod descriptor;
pub mod event;
pub mod link;
pub mod messages;
pub mod registry;
pub mod request;
pub mod router;
pub mod server;
pub mod session;

pub use connector::{ClientConnector, Connector, ConnectorEvent, ConnectorState, Inbound};
pub use descriptor::{
    BroadcastTarget, ForwardTarget, LinkPair, Permission, PermissionCheck, PermissionSet,
};
pub use event::{Event, EventBuilder, EventContext, EventHandler};
pub use link::{Handler, HandlerFuture, Link, Validator};
pub use registry::{Descriptor, DescriptorKind, MessageRegistry};
pub use request::{Request, RequestBuilder, RequestContext, RequestHandler};
pub use router::{Router, StaticRouter};
pub use server::{
    Accepted, Authenticated, Authenticator, ServerConnector, ServerEndpoint, TokenAuthenticator,
};
pub use session::{BufferedFrame, SendBuffer};
