//! Bounded raw-frame queue
//!
//! Producers block while the queue is full instead of dropping frames.
//! Closing the queue releases blocked producers.

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

use crate::types::MediaFrame;

/// How often a blocked producer re-checks the closed flag
const PUSH_POLL: Duration = Duration::from_millis(10);

/// Bounded, thread-safe handoff of raw frames to an encoder
#[derive(Debug)]
pub struct FrameQueue {
    tx: Sender<MediaFrame>,
    rx: Receiver<MediaFrame>,
    capacity: usize,
    closed: AtomicBool,
}

impl FrameQueue {
    /// Create a queue; it starts closed
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(true),
        }
    }

    /// Accept frames
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Refuse frames and release blocked producers
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the queue refuses frames
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a frame, blocking while full
    ///
    /// Returns false if the queue is or becomes closed before the frame
    /// is accepted.
    pub fn push(&self, mut frame: MediaFrame) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            match self.tx.send_timeout(frame, PUSH_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(f)) => {
                    trace!("Frame queue full ({}), producer waiting", self.capacity);
                    frame = f;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Enqueue without blocking, handing the frame back if full or closed
    pub fn try_push(&self, frame: MediaFrame) -> std::result::Result<(), MediaFrame> {
        if self.is_closed() {
            return Err(frame);
        }
        self.tx.try_send(frame).map_err(|e| e.into_inner())
    }

    /// Dequeue a frame, waiting up to `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<MediaFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drop every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Frames currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no frames are queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
