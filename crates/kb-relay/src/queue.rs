//! Unbounded FIFO of outbound frames
//!
//! Decouples the local reader from the upstream writer: the reader keeps
//! accepting data while the upstream drains at its own pace. Frames come out
//! in exactly the order they went in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kb_core::Frame;
use thiserror::Error;
use tokio::sync::mpsc;

/// Returned by `put` when the consuming side has gone away
#[derive(Error, Debug)]
#[error("frame queue closed")]
pub struct QueueClosed(pub Frame);

/// A frame queue owned by a single relay session
///
/// Holding both halves in one value is convenient for tests; the relay
/// calls [`FrameQueue::split`] so producer and consumer can live in
/// separate tasks.
pub struct FrameQueue {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl FrameQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        Self {
            sender: FrameSender {
                tx,
                pending: Arc::clone(&pending),
            },
            receiver: FrameReceiver { rx, pending },
        }
    }

    /// Enqueue a frame
    pub fn put(&self, frame: Frame) -> Result<(), QueueClosed> {
        self.sender.put(frame)
    }

    /// Wait for the next frame
    ///
    /// Never returns `None` while this value also holds the producer half.
    pub async fn get(&mut self) -> Option<Frame> {
        self.receiver.get().await
    }

    /// Number of frames waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Separate the producer and consumer halves
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer half of a [`FrameQueue`]
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<AtomicUsize>,
}

impl FrameSender {
    /// Enqueue a frame without waiting
    pub fn put(&self, frame: Frame) -> Result<(), QueueClosed> {
        // Count before sending so the consumer never sees the counter underflow.
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            QueueClosed(e.0)
        })
    }

    /// Whether the consumer has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a [`FrameQueue`]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<AtomicUsize>,
}

impl FrameReceiver {
    /// Wait for the next frame; `None` once every producer is gone and the
    /// queue is empty
    ///
    /// Cancel safe: dropping the future never loses a frame.
    pub async fn get(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Number of frames waiting
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
