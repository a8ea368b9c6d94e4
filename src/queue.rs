//! Bounded dispatch queue.
//!
//! The queue is the only hand-off point between the concurrent ingress side
//! (transport handlers) and the single detection worker. It is internally
//! synchronized; callers need no extra locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::detect::DetectionResult;
use crate::frame::FrameInput;

/// Where a job's result goes once the worker is done with it.
#[derive(Debug)]
pub enum JobOrigin {
    /// Streamed frame; routed through the publisher to the owning transport.
    Session(String),
    /// One-shot request; the result is sent straight back on `reply`.
    Direct {
        reply: Sender<DetectionResult>,
        /// Attach a JPEG of the frame with the detections drawn on it.
        annotate: bool,
    },
}

/// A unit of pending work.
#[derive(Debug)]
pub struct DetectionJob {
    pub origin: JobOrigin,
    pub image: FrameInput,
    /// Client-supplied (or receive-time) timestamp, seconds since the Unix epoch.
    pub submitted_at: f64,
}

impl DetectionJob {
    pub fn for_session(session_id: impl Into<String>, image: FrameInput, submitted_at: f64) -> Self {
        Self {
            origin: JobOrigin::Session(session_id.into()),
            image,
            submitted_at,
        }
    }

    /// Build a direct job and the receiver its single result will arrive on.
    pub fn direct(
        image: FrameInput,
        submitted_at: f64,
        annotate: bool,
    ) -> (Self, Receiver<DetectionResult>) {
        let (reply, rx) = bounded(1);
        let job = Self {
            origin: JobOrigin::Direct { reply, annotate },
            image,
            submitted_at,
        };
        (job, rx)
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.origin {
            JobOrigin::Session(id) => Some(id),
            JobOrigin::Direct { .. } => None,
        }
    }
}

/// Returned by [`DispatchQueue::enqueue`] when the queue is at capacity.
/// Carries the rejected job back to the caller.
#[derive(Debug)]
pub struct QueueFull(pub DetectionJob);

/// Fixed-capacity FIFO of pending detection jobs.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: Sender<DetectionJob>,
    rx: Receiver<DetectionJob>,
    capacity: usize,
    closed: Arc<AtomicBool>,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` jobs (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a job without blocking. A full queue hands the job straight back.
    ///
    /// Once the queue is closed, accepted jobs are dropped right away, which
    /// disconnects any direct reply channel they carry.
    pub fn enqueue(&self, job: DetectionJob) -> Result<(), QueueFull> {
        match self.tx.try_send(job) {
            Ok(()) => {
                // A close that raced this send has either drained the job
                // already or is observed here.
                if self.closed.load(Ordering::SeqCst) {
                    self.drain();
                }
                Ok(())
            }
            // The queue owns both ends, so it cannot disconnect while `self` lives.
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                Err(QueueFull(job))
            }
        }
    }

    /// Take the oldest job, waiting at most `timeout`. `None` means nothing arrived.
    pub fn dequeue(&self, timeout: Duration) -> Option<DetectionJob> {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => Some(job),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop serving jobs: drop everything pending and everything enqueued later.
    /// Returns how many jobs were dropped.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.drain()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Number of jobs currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
