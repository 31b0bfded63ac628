//! Hand-off of transcript events from recognizer threads to the network task.
//!
//! [`ResultDispatcher::post`] is a plain synchronous call that never performs
//! I/O, so it is safe to invoke from the recognizer's own listener thread.
//! The connection task awaits [`TranscriptReceiver::recv`] on its executor.

use crate::relay::clock::deadline_after;
use crate::relay::types::TranscriptEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Back-off between attempts while the outbound buffer is full.
const POST_BACKOFF: Duration = Duration::from_millis(1);

/// Result of posting one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Delivered,
    /// The buffer stayed full for the whole post timeout; the event was dropped.
    Dropped,
    /// The receiving side is gone.
    Closed,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    posted: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Creates a dispatcher holding at most `capacity` undelivered events.
pub fn result_dispatcher(
    capacity: usize,
    post_timeout: Duration,
) -> (ResultDispatcher, TranscriptReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(DispatchStats::default());
    (
        ResultDispatcher {
            tx,
            post_timeout,
            stats: stats.clone(),
        },
        TranscriptReceiver { rx, stats },
    )
}

/// Sending half; cheap to clone into recognizer callbacks.
#[derive(Clone)]
pub struct ResultDispatcher {
    tx: mpsc::Sender<TranscriptEvent>,
    post_timeout: Duration,
    stats: Arc<DispatchStats>,
}

impl ResultDispatcher {
    /// Queues `event` for the network task, in call order.
    ///
    /// Returns immediately when there is room; otherwise waits at most the
    /// post timeout. Must not be called from inside an async task.
    pub fn post(&self, event: TranscriptEvent) -> PostOutcome {
        let deadline = deadline_after(self.post_timeout);
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.posted.fetch_add(1, Ordering::Relaxed);
                    return PostOutcome::Delivered;
                }
                Err(TrySendError::Closed(_)) => return PostOutcome::Closed,
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "transcript buffer full for {:?}, dropped event: {:?}",
                            self.post_timeout,
                            returned.text
                        );
                        return PostOutcome::Dropped;
                    }
                    event = returned;
                    thread::sleep(POST_BACKOFF);
                }
            }
        }
    }

    /// Returns true once the receiving side has been dropped or closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

/// Receiving half, owned by the connection task.
pub struct TranscriptReceiver {
    rx: mpsc::Receiver<TranscriptEvent>,
    stats: Arc<DispatchStats>,
}

impl TranscriptReceiver {
    /// Waits for the next event; `None` once every dispatcher clone is dropped.
    pub async fn recv(&mut self) -> Option<TranscriptEvent> {
        self.rx.recv().await
    }

    /// Takes an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<TranscriptEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new events; buffered ones can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}
