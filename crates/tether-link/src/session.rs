//! Per-connection session bookkeeping shared by client and server connectors.
//!
//! A session outlives the sockets it runs on. It owns:
//!
//! - the outbound sequence counter (starts at 1, never reused)
//! - the replay buffer of sent but unacknowledged routable frames
//! - the last sequence number received from the peer (for acks and dedupe)
//! - the heartbeat timer and the time traffic was last seen
//!
//! The socket itself is driven by two tasks per connection: a writer fed
//! through an unbounded channel and a reader that hands every frame back to
//! the owning connector together with the connection's generation number,
//! so events from a replaced socket are recognised and ignored.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{Envelope, Heartbeat, Result};
use tether_transport::{CloseFrame, FrameSink, FrameStream, Incoming};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// An encoded routable frame kept for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFrame {
    /// Sequence number assigned on send
    pub seq: u64,
    /// Encoded frame text
    pub text: String,
}

/// Outbound frames awaiting acknowledgement, in ascending `seq` order
#[derive(Debug, Clone, Default)]
pub struct SendBuffer {
    entries: VecDeque<BufferedFrame>,
}

impl SendBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; `seq` must be greater than every buffered seq
    pub fn push(&mut self, seq: u64, text: String) {
        debug_assert!(self.entries.back().is_none_or(|last| last.seq < seq));
        self.entries.push_back(BufferedFrame { seq, text });
    }

    /// Remove every entry with `seq <= ack` from the front
    ///
    /// Returns the number of entries removed.
    pub fn drop_through(&mut self, ack: u64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|entry| entry.seq <= ack) {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Buffered sequence numbers, oldest first
    #[must_use]
    pub fn seqs(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.seq).collect()
    }

    /// Iterate buffered frames, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &BufferedFrame> {
        self.entries.iter()
    }

    /// Number of buffered frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is awaiting acknowledgement
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Work item for a connection's writer task
#[derive(Debug)]
pub(crate) enum Outgoing {
    Text(String),
    Close(CloseFrame),
}

/// Spawn the writer task for a sink
///
/// The task ends after sending a close frame, on the first send error, or
/// when every sender is dropped (which drops the sink).
pub(crate) fn spawn_writer(mut sink: Box<dyn FrameSink>) -> mpsc::UnboundedSender<Outgoing> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Text(text) => {
                    if let Err(e) = sink.send_text(text).await {
                        tracing::debug!("Socket write failed: {}", e);
                        break;
                    }
                }
                Outgoing::Close(frame) => {
                    if let Err(e) = sink.close(frame).await {
                        tracing::debug!("Socket close failed: {}", e);
                    }
                    break;
                }
            }
        }
    });
    tx
}

/// Callbacks a connector receives from its socket tasks
#[async_trait]
pub(crate) trait SocketOwner: Send + Sync + 'static {
    /// A text frame arrived on connection `generation`
    async fn on_text(self: Arc<Self>, generation: u64, text: String);

    /// Connection `generation` ended, with the close frame if one was received
    async fn on_closed(self: Arc<Self>, generation: u64, frame: Option<CloseFrame>);

    /// Heartbeat timer fired; returns false to stop the timer
    async fn on_heartbeat_tick(self: Arc<Self>, generation: u64) -> bool;
}

/// Spawn the reader task for a stream
pub(crate) fn spawn_reader<O: SocketOwner>(
    owner: Weak<O>,
    generation: u64,
    mut stream: Box<dyn FrameStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = stream.next_frame().await;
            let Some(owner) = owner.upgrade() else {
                break;
            };
            match next {
                Some(Ok(Incoming::Text(text))) => owner.on_text(generation, text).await,
                Some(Ok(Incoming::Closed(frame))) => {
                    owner.on_closed(generation, frame).await;
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!("Socket read failed: {}", e);
                    owner.on_closed(generation, None).await;
                    break;
                }
                None => {
                    owner.on_closed(generation, None).await;
                    break;
                }
            }
        }
    })
}

/// Spawn the heartbeat timer for connection `generation`
pub(crate) fn spawn_heartbeat<O: SocketOwner>(
    owner: Weak<O>,
    generation: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now()
            .checked_add(interval)
            .unwrap_or_else(Instant::now);
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(owner) = owner.upgrade() else {
                break;
            };
            if !owner.on_heartbeat_tick(generation).await {
                break;
            }
        }
    })
}

/// Outcome of a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatTick {
    /// A heartbeat was sent
    Sent,
    /// Nothing was heard from the peer within twice the interval
    TimedOut,
}

/// Session state owned by one connector
#[derive(Debug)]
pub(crate) struct SessionCore {
    next_seq: u64,
    last_received_seq: Option<u64>,
    send_buffer: SendBuffer,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    last_heartbeat: Instant,
    heartbeat_interval: Option<Duration>,
    heartbeat: Option<JoinHandle<()>>,
}

impl SessionCore {
    pub(crate) fn new() -> Self {
        Self {
            next_seq: 1,
            last_received_seq: None,
            send_buffer: SendBuffer::new(),
            writer: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: None,
            heartbeat: None,
        }
    }

    /// Sequence number the next routable send will get
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn last_received_seq(&self) -> Option<u64> {
        self.last_received_seq
    }

    pub(crate) fn send_buffer(&self) -> &SendBuffer {
        &self.send_buffer
    }

    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Encode a routable envelope under a fresh sequence number and buffer it
    ///
    /// The frame is transmitted too when `transmit` is set.
    pub(crate) fn push_routable(&mut self, envelope: &Envelope, transmit: bool) -> Result<u64> {
        let seq = self.next_seq;
        let text = envelope.to_frame(Some(seq))?.to_text()?;
        self.next_seq += 1;
        if transmit {
            self.transmit(text.clone());
        }
        self.send_buffer.push(seq, text);
        Ok(seq)
    }

    /// Send a frame without a sequence number (handshake, heartbeat, disconnect)
    pub(crate) fn send_unsequenced(&self, envelope: &Envelope) -> Result<bool> {
        let text = envelope.to_frame(None)?.to_text()?;
        Ok(self.transmit(text))
    }

    fn transmit(&self, text: String) -> bool {
        match &self.writer {
            Some(writer) => writer.send(Outgoing::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Retransmit everything still buffered, oldest first
    pub(crate) fn flush(&self) {
        for entry in self.send_buffer.iter() {
            if !self.transmit(entry.text.clone()) {
                break;
            }
        }
    }

    /// The peer acknowledged everything up to and including `ack`
    pub(crate) fn acknowledge(&mut self, ack: u64) {
        let removed = self.send_buffer.drop_through(ack);
        if removed > 0 {
            tracing::trace!(ack, removed, "Trimmed send buffer");
        }
    }

    /// Record an inbound routable seq; returns false for a duplicate
    pub(crate) fn accept_seq(&mut self, seq: u64) -> bool {
        if self.last_received_seq.is_some_and(|last| seq <= last) {
            return false;
        }
        self.last_received_seq = Some(seq);
        true
    }

    /// Traffic was seen on the socket
    pub(crate) fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Use a new socket writer
    pub(crate) fn attach(&mut self, writer: mpsc::UnboundedSender<Outgoing>) {
        self.writer = Some(writer);
        self.touch();
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.writer.is_some()
    }

    /// Forget the socket writer and stop the heartbeat
    pub(crate) fn detach(&mut self) {
        self.writer = None;
        self.stop_heartbeat();
    }

    /// Send a close frame and forget the socket writer
    pub(crate) fn close_socket(&mut self, code: u16, reason: &str) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(Outgoing::Close(CloseFrame::new(code, reason)));
        }
        self.stop_heartbeat();
    }

    pub(crate) fn start_heartbeat(&mut self, interval: Duration, task: JoinHandle<()>) {
        self.stop_heartbeat();
        self.heartbeat_interval = Some(interval);
        self.heartbeat = Some(task);
        self.touch();
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    /// Heartbeat timer tick: check liveness, then send `heartbeat{seq}`
    pub(crate) fn heartbeat_tick(&mut self) -> HeartbeatTick {
        let Some(interval) = self.heartbeat_interval else {
            return HeartbeatTick::Sent;
        };
        if self.last_heartbeat.elapsed() > interval.saturating_mul(2) {
            return HeartbeatTick::TimedOut;
        }
        let heartbeat = Envelope::Heartbeat(Heartbeat {
            seq: self.last_received_seq,
        });
        if let Err(e) = self.send_unsequenced(&heartbeat) {
            tracing::warn!("Failed to encode heartbeat: {}", e);
        }
        HeartbeatTick::Sent
    }

    /// Clear the session: received seq, replay buffer and heartbeat interval
    ///
    /// The outbound sequence counter is kept so sequence numbers are never
    /// reused on this connector.
    pub(crate) fn reset(&mut self) {
        self.last_received_seq = None;
        self.send_buffer.clear();
        self.heartbeat_interval = None;
        self.stop_heartbeat();
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
