//! # tether core
//!
//! Protocol building blocks shared by every tether peer.
//!
//! This crate provides:
//! - Structured addresses with broadcast semantics
//! - Wire envelopes with strict shape validation
//! - The link error taxonomy
//! - Exponential backoff and a coalescing rate limiter
//! - Connector / server configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Request / Event descriptors                     │
//! │        (typed payloads, permissions, forwarding, broadcast)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                            Link                                  │
//! │        (validators, handlers, one-shot waiters per type)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Connector                               │
//! │   (handshake, session token, heartbeat, replay, reconnect)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Envelopes                               │
//! │          ({seq, type, data} JSON frames over a socket)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod backoff;
pub mod config;
pub mod envelope;
pub mod error;
pub mod rate_limiter;

pub use address::{Address, AddressError, AddressShorthand, AddressType};
pub use backoff::Backoff;
pub use config::{ConnectorConfig, ServerConfig};
pub use envelope::{
    Continue, DisconnectPhase, Envelope, ErrorData, Frame, Heartbeat, Hello, Message, NamedBody,
    Ready, RegisterControl, RegisterHost, Registration, ResponseBody, ResponseErrorBody, Resume,
};
pub use error::{LinkError, Result};
pub use rate_limiter::RateLimiter;

/// Protocol version announced in `hello`
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Close code: normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code: invalid handshake or heartbeat frame
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close code: heartbeat timeout
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1008;

/// Close code: authentication failed (terminal, no reconnect)
pub const CLOSE_AUTH_FAILED: u16 = 4003;
