//! Socket transports for tether links.
//!
//! Connectors talk to a [`Connection`] split into a [`FrameSink`] and a
//! [`FrameStream`]; clients obtain fresh connections from a [`Dialer`].
//!
//! - [`websocket`]: production transport over tokio-tungstenite
//! - [`memory`]: in-process channel transport for tests and embedding

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod websocket;

pub use memory::{MemoryAcceptor, MemoryDialer};
pub use transport::{
    CloseFrame, Connection, Dialer, FrameSink, FrameStream, Incoming, TransportError,
    TransportResult,
};
pub use websocket::WebSocketDialer;
