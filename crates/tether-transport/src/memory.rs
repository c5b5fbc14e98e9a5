//! In-process transport.
//!
//! [`pair`] returns two connected [`Connection`]s backed by unbounded
//! channels. [`listener`] returns a re-dialable [`MemoryDialer`] and the
//! [`MemoryAcceptor`] that receives the server end of every dialed pair,
//! which lets a client connector drop and reconnect entirely in memory.
//!
//! Closing behaves like a WebSocket close handshake: the peer receives the
//! close frame, and the closing side's own stream reports the close as well.
//! Dropping a connection without closing is seen by the peer as the stream
//! ending with no close frame.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::transport::{
    CloseFrame, Connection, Dialer, FrameSink, FrameStream, Incoming, TransportError,
    TransportResult,
};

struct MemorySink {
    peer: Option<mpsc::UnboundedSender<Incoming>>,
    own: mpsc::WeakUnboundedSender<Incoming>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        let peer = self.peer.as_ref().ok_or(TransportError::Closed)?;
        peer.send(Incoming::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, frame: CloseFrame) -> TransportResult<()> {
        let peer = self.peer.take().ok_or(TransportError::Closed)?;
        let _ = peer.send(Incoming::Closed(Some(frame.clone())));
        if let Some(own) = self.own.upgrade() {
            let _ = own.send(Incoming::Closed(Some(frame)));
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Incoming>,
    finished: bool,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<TransportResult<Incoming>> {
        if self.finished {
            return None;
        }
        let incoming = self.rx.recv().await?;
        if matches!(incoming, Incoming::Closed(_)) {
            self.finished = true;
        }
        Some(Ok(incoming))
    }
}

/// Create two connected in-memory connections
#[must_use]
pub fn pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = Connection::new(
        Box::new(MemorySink {
            peer: Some(b_tx.clone()),
            own: a_tx.downgrade(),
        }),
        Box::new(MemoryStream {
            rx: a_rx,
            finished: false,
        }),
    );
    let b = Connection::new(
        Box::new(MemorySink {
            peer: Some(a_tx),
            own: b_tx.downgrade(),
        }),
        Box::new(MemoryStream {
            rx: b_rx,
            finished: false,
        }),
    );
    drop(b_tx);
    (a, b)
}

/// Client side of an in-memory listener
#[derive(Clone)]
pub struct MemoryDialer {
    incoming: mpsc::UnboundedSender<Connection>,
    refuse: Arc<AtomicBool>,
    dials: Arc<AtomicU64>,
}

impl MemoryDialer {
    /// Make subsequent dials fail (simulates an unreachable peer)
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, successful or not
    #[must_use]
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> TransportResult<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        let (client, server) = pair();
        self.incoming
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Server side of an in-memory listener
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl MemoryAcceptor {
    /// Wait for the next dialed connection
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

/// Create a dialer / acceptor pair
#[must_use]
pub fn listener() -> (MemoryDialer, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryDialer {
            incoming: tx,
            refuse: Arc::new(AtomicBool::new(false)),
            dials: Arc::new(AtomicU64::new(0)),
        },
        MemoryAcceptor { incoming: rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_text() {
        let (mut a, mut b) = pair();
        a.sink.send_text("hello".to_string()).await.unwrap();
        b.sink.send_text("world".to_string()).await.unwrap();

        assert_eq!(
            b.stream.next_frame().await.unwrap().unwrap(),
            Incoming::Text("hello".to_string())
        );
        assert_eq!(
            a.stream.next_frame().await.unwrap().unwrap(),
            Incoming::Text("world".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_reaches_both_sides() {
        let (mut a, mut b) = pair();
        a.sink.close(CloseFrame::new(1008, "timeout")).await.unwrap();

        let expected = Incoming::Closed(Some(CloseFrame::new(1008, "timeout")));
        assert_eq!(b.stream.next_frame().await.unwrap().unwrap(), expected);
        assert_eq!(a.stream.next_frame().await.unwrap().unwrap(), expected);
        assert!(a.stream.next_frame().await.is_none());
        assert!(a.sink.send_text("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_ends_peer_stream() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.stream.next_frame().await.is_none());
        assert!(b.sink.send_text("anyone?".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_listener_redial() {
        let (dialer, mut acceptor) = listener();

        let mut first = dialer.dial().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();
        first.sink.send_text("one".to_string()).await.unwrap();
        assert_eq!(
            server.stream.next_frame().await.unwrap().unwrap(),
            Incoming::Text("one".to_string())
        );

        drop(first);
        let _second = dialer.dial().await.unwrap();
        assert!(acceptor.accept().await.is_some());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let (dialer, _acceptor) = listener();
        dialer.set_refuse(true);
        assert!(matches!(
            dialer.dial().await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
