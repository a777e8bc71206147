//! Channel abstraction: one physical duplex connection plus its framing.
//!
//! # Architecture
//!
//! ```text
//! Channel (send side, shared)            ChannelReader (receive side, owned)
//!     │                                       │
//!     ├── outbound MiddlewarePipeline         ├── frame reassembly
//!     └── Box<dyn FrameSink>                  ├── inbound MiddlewarePipeline
//!         (behind an async mutex)             └── Box<dyn FrameSource>
//! ```
//!
//! The transport itself is an external collaborator reached through
//! [`FrameSink`] and [`FrameSource`]. Adapters live in [`memory`] (in-process
//! pairs) and [`websocket`] (`tokio-tungstenite`).
//!
//! Sends are serialized: the sink lock is held for the full middleware pass
//! plus the write, so bytes of two logical messages never interleave. A send on
//! a channel that is no longer open is a silent no-op.

// Rust guideline compliant 2026-02

pub mod memory;
pub mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::middleware::{MiddlewareError, MiddlewarePipeline};
use crate::protocol::{Message, ProtocolError};

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the underlying connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport rejected a write.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The transport failed while reading.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport closed before a message was complete.
    #[error("channel closed")]
    Closed,

    /// A middleware stage failed the send or receive.
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    /// The reassembled bytes were not a valid message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Whether the error ends the connection.
    ///
    /// Middleware and protocol failures only spoil one message; transport
    /// failures leave nothing to read from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Middleware(_) | Self::Protocol(_))
    }
}

/// Close status sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Normal closure (1000).
    Normal,
    /// Endpoint going away (1001).
    GoingAway,
    /// Protocol violation (1002).
    ProtocolError,
    /// Unexpected internal condition (1011).
    InternalError,
}

impl CloseStatus {
    /// WebSocket-compatible status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::InternalError => 1011,
        }
    }
}

/// One transport frame. A message may span several frames; the last one has
/// `end_of_message` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    /// Frame bytes.
    pub payload: Vec<u8>,
    /// Whether this frame completes the current message.
    pub end_of_message: bool,
}

impl TransportFrame {
    /// A frame that carries a whole message.
    pub fn complete(payload: Vec<u8>) -> Self {
        Self {
            payload,
            end_of_message: true,
        }
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete message.
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Close the transport with a status.
    async fn close(&mut self, status: CloseStatus, reason: &str) -> Result<(), ChannelError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame; `None` once the peer has closed.
    async fn next_frame(&mut self) -> Option<Result<TransportFrame, ChannelError>>;
}

/// Process-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Send side of a duplex connection.
pub struct Channel {
    id: ChannelId,
    sink: Mutex<Box<dyn FrameSink>>,
    open: Arc<AtomicBool>,
    pipeline: MiddlewarePipeline,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Open a channel over a transport, returning the shared send side and the
    /// single receive side.
    pub fn open(
        sink: impl FrameSink,
        source: impl FrameSource,
        pipeline: MiddlewarePipeline,
    ) -> (Arc<Self>, ChannelReader) {
        let open = Arc::new(AtomicBool::new(true));
        let channel = Arc::new(Self {
            id: ChannelId::next(),
            sink: Mutex::new(Box::new(sink)),
            open: Arc::clone(&open),
            pipeline: pipeline.clone(),
        });
        let reader = ChannelReader {
            channel_id: channel.id,
            source: Box::new(source),
            buffer: Vec::new(),
            open,
            pipeline,
        };
        (channel, reader)
    }

    /// Channel identifier.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether the channel still accepts sends.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Encode and send a message.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        if !self.is_open() {
            log::trace!("[Channel] {} closed, dropping {:?}", self.id, message.message_type());
            return Ok(());
        }
        self.send_raw(message.encode()?).await
    }

    /// Send already encoded message bytes through the outbound chain.
    pub async fn send_raw(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return Ok(());
        }

        let wire = self.pipeline.run_send(payload).await?;
        if let Err(e) = sink.send_frame(wire).await {
            self.open.store(false, Ordering::Release);
            log::warn!("[Channel] {} write failed: {e}", self.id);
            return Err(e);
        }
        Ok(())
    }

    /// Close the transport. Only the first call reaches the transport.
    pub async fn close(&self, status: CloseStatus, reason: &str) {
        let mut sink = self.sink.lock().await;
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = sink.close(status, reason).await {
            log::debug!("[Channel] {} close ({}) failed: {e}", self.id, status.code());
        }
    }
}

/// Receive side of a channel: the single reader.
pub struct ChannelReader {
    channel_id: ChannelId,
    source: Box<dyn FrameSource>,
    buffer: Vec<u8>,
    open: Arc<AtomicBool>,
    pipeline: MiddlewarePipeline,
}

impl fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReader")
            .field("channel_id", &self.channel_id)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl ChannelReader {
    /// Id of the channel this reader belongs to.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Next complete message after the inbound chain, as raw bytes.
    ///
    /// Returns `None` when the transport has closed. A transport error marks the
    /// channel closed; middleware errors do not.
    pub async fn next_payload(&mut self) -> Option<Result<Vec<u8>, ChannelError>> {
        loop {
            match self.source.next_frame().await {
                Some(Ok(frame)) => {
                    self.buffer.extend_from_slice(&frame.payload);
                    if !frame.end_of_message {
                        continue;
                    }
                    let wire = std::mem::take(&mut self.buffer);
                    return Some(self.pipeline.run_receive(wire).await.map_err(ChannelError::from));
                }
                Some(Err(e)) => {
                    self.open.store(false, Ordering::Release);
                    return Some(Err(e));
                }
                None => {
                    self.open.store(false, Ordering::Release);
                    if !self.buffer.is_empty() {
                        log::debug!(
                            "[Channel] {} closed with {} bytes of partial message",
                            self.channel_id,
                            self.buffer.len()
                        );
                        self.buffer.clear();
                    }
                    return None;
                }
            }
        }
    }

    /// Next complete, decoded message.
    pub async fn recv(&mut self) -> Option<Result<Message, ChannelError>> {
        let payload = match self.next_payload().await? {
            Ok(payload) => payload,
            Err(e) => return Some(Err(e)),
        };
        Some(Message::decode(&payload).map_err(ChannelError::from))
    }
}
