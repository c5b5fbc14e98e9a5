//! Error types for tether links.
//!
//! Errors are grouped the way callers need to react to them:
//!
//! - **Protocol violations** (`InvalidMessage`): a single inbound message was
//!   malformed or nobody was waiting for it. Local to that message.
//! - **Session loss** (`SessionLost`): the session was closed, invalidated or
//!   abandoned. Every in-flight request fails with it; callers re-issue after
//!   reconnecting if the request is safe to repeat.
//! - **Remote failures** (`Request`): the peer's handler failed and answered
//!   with a `responseError`.
//! - **Terminal handshake failures** (`AuthenticationFailed`): never retried.
//!
//! # Example
//!
//! ```
//! use tether_core::LinkError;
//!
//! fn should_reissue(err: &LinkError) -> bool {
//!     // Only re-send idempotent requests, and only after the session is back
//!     err.is_transient()
//! }
//!
//! assert!(should_reissue(&LinkError::session_lost("connection closed")));
//! assert!(!should_reissue(&LinkError::AuthenticationFailed("bad token".into())));
//! ```

use std::borrow::Cow;
use thiserror::Error;

use crate::address::AddressError;

/// Errors that can occur on a link, its connector or a message descriptor
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    // ============ Protocol Errors ============
    /// Malformed, unvalidated or unhandled envelope
    #[error("Invalid message: {0}")]
    InvalidMessage(Cow<'static, str>),

    /// Session token invalid, expired or closed
    #[error("Session lost: {0}")]
    SessionLost(Cow<'static, str>),

    /// Application-level failure reported by the remote handler
    #[error("{message}")]
    Request {
        /// Error message from the remote handler
        message: String,
        /// Optional machine readable error code
        code: Option<String>,
        /// Optional remote stack / backtrace
        stack: Option<String>,
    },

    // ============ Handshake Errors ============
    /// Credentials rejected during the handshake
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Caller lacks the permission a request requires
    #[error("Permission denied: {0}")]
    Permission(String),

    // ============ Transport Errors ============
    /// Socket-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Address could not be parsed or built
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LinkError {
    /// Returns true if the operation may succeed once the session is back
    ///
    /// Transient errors include:
    /// - Session loss (the connector may reconnect and start a new session)
    /// - Transport failures
    /// - Timeouts
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::SessionLost(_) | LinkError::Transport(_) | LinkError::Timeout(_)
        )
    }

    /// Returns true if the operation will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            LinkError::AuthenticationFailed(_)
                | LinkError::Permission(_)
                | LinkError::InvalidConfig(_)
                | LinkError::Address(_)
        )
    }

    /// Create an invalid message error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_message(context: &'static str) -> Self {
        LinkError::InvalidMessage(Cow::Borrowed(context))
    }

    /// Create a session lost error with static context (zero allocation)
    #[must_use]
    pub const fn session_lost(context: &'static str) -> Self {
        LinkError::SessionLost(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        LinkError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        LinkError::Timeout(Cow::Borrowed(context))
    }

    /// Create a remote request error carrying only a message
    #[must_use]
    pub fn request(message: impl Into<String>) -> Self {
        LinkError::Request {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    /// Machine readable code sent in a `responseError` for this error
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            LinkError::Request { code, .. } => code.as_deref(),
            LinkError::InvalidMessage(_) => Some("InvalidMessage"),
            LinkError::SessionLost(_) => Some("SessionLost"),
            LinkError::Permission(_) => Some("PermissionDenied"),
            LinkError::AuthenticationFailed(_) => Some("AuthenticationFailed"),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;
