//! In-process duplex transport.
//!
//! Two [`MemoryTransport`] ends connected by unbounded mpsc queues. Used by
//! tests and by hosts that run client and server in one process. An optional
//! maximum frame size splits each message into several frames so reassembly
//! in [`ChannelReader`](super::ChannelReader) is exercised.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelError, CloseStatus, FrameSink, FrameSource, TransportFrame};

#[derive(Debug)]
enum Signal {
    Frame(TransportFrame),
    Close(CloseStatus),
}

/// One end of an in-memory duplex pair.
#[derive(Debug)]
pub struct MemoryTransport {
    sink: MemorySink,
    source: MemorySource,
}

impl MemoryTransport {
    /// Split into write and read halves.
    pub fn into_parts(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

/// Create a connected pair with whole-message frames.
pub fn duplex() -> (MemoryTransport, MemoryTransport) {
    pair(None)
}

/// Create a connected pair that splits messages into frames of at most
/// `max_frame` bytes.
pub fn duplex_with_max_frame(max_frame: usize) -> (MemoryTransport, MemoryTransport) {
    pair(Some(max_frame.max(1)))
}

fn pair(max_frame: Option<usize>) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemoryTransport {
        sink: MemorySink {
            tx: Some(a_tx),
            max_frame,
        },
        source: MemorySource { rx: b_rx },
    };
    let b = MemoryTransport {
        sink: MemorySink {
            tx: Some(b_tx),
            max_frame,
        },
        source: MemorySource { rx: a_rx },
    };
    (a, b)
}

/// Write half of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Signal>>,
    max_frame: Option<usize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        let frames = match self.max_frame {
            Some(max) if payload.len() > max => {
                let chunks: Vec<&[u8]> = payload.chunks(max).collect();
                let last = chunks.len() - 1;
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| TransportFrame {
                        payload: chunk.to_vec(),
                        end_of_message: i == last,
                    })
                    .collect()
            }
            _ => vec![TransportFrame::complete(payload)],
        };
        for frame in frames {
            tx.send(Signal::Frame(frame))
                .map_err(|_| ChannelError::SendFailed("peer dropped".to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self, status: CloseStatus, _reason: &str) -> Result<(), ChannelError> {
        if let Some(tx) = self.tx.take() {
            // Peer may already be gone; nothing to report then.
            let _ = tx.send(Signal::Close(status));
        }
        Ok(())
    }
}

/// Read half of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Signal>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<TransportFrame, ChannelError>> {
        match self.rx.recv().await? {
            Signal::Frame(frame) => Some(Ok(frame)),
            Signal::Close(status) => {
                log::trace!("[Channel] memory peer closed ({})", status.code());
                self.rx.close();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_pair() {
        let (a, b) = duplex();
        let (mut a_sink, _a_source) = a.into_parts();
        let (_b_sink, mut b_source) = b.into_parts();

        a_sink.send_frame(b"hello".to_vec()).await.unwrap();
        let frame = b_source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, TransportFrame::complete(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_max_frame_splits_message() {
        let (a, b) = duplex_with_max_frame(3);
        let (mut a_sink, _a_source) = a.into_parts();
        let (_b_sink, mut b_source) = b.into_parts();

        a_sink.send_frame(b"abcdefg".to_vec()).await.unwrap();
        let mut parts = Vec::new();
        loop {
            let frame = b_source.next_frame().await.unwrap().unwrap();
            parts.push(frame.payload);
            if frame.end_of_message {
                break;
            }
        }
        assert_eq!(parts, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_ends_peer_source() {
        let (a, b) = duplex();
        let (mut a_sink, _a_source) = a.into_parts();
        let (_b_sink, mut b_source) = b.into_parts();

        a_sink.close(CloseStatus::Normal, "").await.unwrap();
        assert!(b_source.next_frame().await.is_none());
        assert!(a_sink.send_frame(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_source() {
        let (a, b) = duplex();
        let (_b_sink, mut b_source) = b.into_parts();
        drop(a);
        assert!(b_source.next_frame().await.is_none());
    }
}
