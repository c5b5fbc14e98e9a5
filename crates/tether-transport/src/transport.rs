//! Transport trait abstraction for framed text connections.
//!
//! A tether session runs over one long-lived socket per peer pair. The
//! connector only needs three things from it: send a text frame, receive
//! the next text frame, and close with a code. This module defines those
//! seams so the same connector runs over WebSockets in production and over
//! in-memory channels in tests.

use async_trait::async_trait;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid URL or configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Close code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code (1000 normal, 1002 protocol error, 1008 policy, 4xxx application)
    pub code: u16,
    /// Human readable reason
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Something that arrived on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A text frame
    Text(String),
    /// The peer closed the connection, with its close frame if one was sent
    Closed(Option<CloseFrame>),
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the connection is gone.
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Send a close frame and stop writing
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the close frame cannot be delivered.
    async fn close(&mut self, frame: CloseFrame) -> TransportResult<()>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame
    ///
    /// Returns `None` once the connection ended without a close frame and
    /// nothing more will arrive.
    async fn next_frame(&mut self) -> Option<TransportResult<Incoming>>;
}

/// An established connection, split into its halves
pub struct Connection {
    /// Write half
    pub sink: Box<dyn FrameSink>,
    /// Read half
    pub stream: Box<dyn FrameStream>,
}

impl Connection {
    /// Bundle two halves
    #[must_use]
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens fresh connections to one fixed peer
///
/// Connectors keep their dialer for the lifetime of the session and dial
/// again after every drop.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the peer is unreachable.
    async fn dial(&self) -> TransportResult<Connection>;

    /// Human readable description of the peer, for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = TransportError::InvalidConfig("bad url".to_string());
        assert!(err.to_string().contains("Invalid configuration"));

        let err = TransportError::Other("test error".to_string());
        assert_eq!(err.to_string(), "Transport error: test error");
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }

    #[test]
    fn test_close_frame() {
        let frame = CloseFrame::new(1008, "Heartbeat timeout");
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason, "Heartbeat timeout");
    }
}
