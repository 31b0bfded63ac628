//! Bounded single-producer/single-consumer hand-off for client audio.
//!
//! The network task owns the [`FrameSender`], the session worker owns the
//! [`FrameReceiver`]. Neither half is `Clone`, so the one-producer/one-consumer
//! discipline is enforced by the type system rather than by locking.

use crate::relay::clock::deadline_after;
use crate::relay::types::AudioFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Back-off between attempts in [`FrameSender::push_async`].
const ASYNC_PUSH_BACKOFF: Duration = Duration::from_millis(2);

/// What to do when a frame arrives and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait up to `timeout` for space, then reject the new frame.
    Block { timeout: Duration },
    /// Evict the oldest buffered frame to make room.
    DropOldest,
}

/// Result of pushing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame is buffered.
    Queued { sequence: u64 },
    /// The frame is buffered; the frame with sequence `evicted` was discarded.
    EvictedOldest { sequence: u64, evicted: u64 },
    /// No space became available within the block timeout; the frame was discarded.
    Rejected { sequence: u64 },
    /// The queue is closed or its consumer is gone.
    Closed,
}

/// Result of pulling from the queue.
#[derive(Debug)]
pub enum PullOutcome {
    Frame(AudioFrame),
    /// Nothing arrived within the timeout.
    Empty,
    /// The producer closed the queue and every buffered frame was delivered.
    Closed,
}

/// Counters shared by both halves of the queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    consumer_gone: AtomicBool,
}

impl QueueStats {
    /// Frames accepted into the queue.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Frames discarded by the drop-oldest policy.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Frames refused after a block timeout.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Creates a bounded audio queue.
///
/// # Panics
/// Panics if `capacity` is zero; a rendezvous channel would make every push
/// wait for the worker.
pub fn audio_frame_queue(capacity: usize, policy: OverflowPolicy) -> (FrameSender, FrameReceiver) {
    assert!(capacity > 0, "audio queue capacity must be positive");
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats::default());
    let evict_rx = match policy {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        OverflowPolicy::Block { .. } => None,
    };

    let sender = FrameSender {
        tx: Some(tx),
        evict_rx,
        policy,
        next_sequence: 0,
        stats: stats.clone(),
    };
    let receiver = FrameReceiver { rx, stats };
    (sender, receiver)
}

/// Producer half, owned by the network task.
pub struct FrameSender {
    tx: Option<Sender<AudioFrame>>,
    // Only used to evict under `DropOldest`; never hands frames onward.
    evict_rx: Option<Receiver<AudioFrame>>,
    policy: OverflowPolicy,
    next_sequence: u64,
    stats: Arc<QueueStats>,
}

impl FrameSender {
    /// Pushes a frame, blocking the calling thread for at most the policy's
    /// timeout. Use [`push_async`](Self::push_async) from async code.
    pub fn push(&mut self, data: Vec<u8>) -> PushOutcome {
        let Some(tx) = self.open_sender() else {
            return PushOutcome::Closed;
        };
        let frame = self.next_frame(data);
        let sequence = frame.sequence();

        match self.policy {
            OverflowPolicy::Block { timeout } => match tx.send_timeout(frame, timeout) {
                Ok(()) => self.queued(sequence),
                Err(SendTimeoutError::Timeout(_)) => self.rejected(sequence),
                Err(SendTimeoutError::Disconnected(_)) => PushOutcome::Closed,
            },
            OverflowPolicy::DropOldest => self.push_evicting(tx, frame),
        }
    }

    /// Pushes a frame without blocking the executor thread.
    ///
    /// Under `Block` the task yields between attempts until the timeout
    /// elapses; under `DropOldest` this never waits.
    pub async fn push_async(&mut self, data: Vec<u8>) -> PushOutcome {
        let Some(tx) = self.open_sender() else {
            return PushOutcome::Closed;
        };
        let frame = self.next_frame(data);
        let sequence = frame.sequence();

        let timeout = match self.policy {
            OverflowPolicy::Block { timeout } => timeout,
            OverflowPolicy::DropOldest => return self.push_evicting(tx, frame),
        };

        let deadline = deadline_after(timeout);
        let mut frame = frame;
        loop {
            match tx.try_send(frame) {
                Ok(()) => return self.queued(sequence),
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline || self.consumer_gone() {
                        return self.rejected(sequence);
                    }
                    frame = returned;
                    tokio::time::sleep(ASYNC_PUSH_BACKOFF).await;
                }
            }
        }
    }

    /// Closes the queue. Buffered frames are still delivered; afterwards the
    /// consumer sees [`PullOutcome::Closed`]. Calling this again is a no-op.
    pub fn close(&mut self) {
        self.tx = None;
        self.evict_rx = None;
    }

    /// Returns true after `close()` or once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none() || self.consumer_gone()
    }

    /// Number of frames currently buffered.
    pub fn len(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn open_sender(&self) -> Option<Sender<AudioFrame>> {
        if self.consumer_gone() {
            return None;
        }
        self.tx.clone()
    }

    fn consumer_gone(&self) -> bool {
        self.stats.consumer_gone.load(Ordering::Acquire)
    }

    fn next_frame(&mut self, data: Vec<u8>) -> AudioFrame {
        let frame = AudioFrame::new(data, self.next_sequence);
        self.next_sequence += 1;
        frame
    }

    fn queued(&self, sequence: u64) -> PushOutcome {
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        PushOutcome::Queued { sequence }
    }

    fn rejected(&self, sequence: u64) -> PushOutcome {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("audio queue full, rejected frame #{}", sequence);
        PushOutcome::Rejected { sequence }
    }

    fn push_evicting(&self, tx: Sender<AudioFrame>, mut frame: AudioFrame) -> PushOutcome {
        let sequence = frame.sequence();
        let mut evicted = None;
        loop {
            match tx.try_send(frame) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return match evicted {
                        Some(evicted) => PushOutcome::EvictedOldest { sequence, evicted },
                        None => PushOutcome::Queued { sequence },
                    };
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
                Err(TrySendError::Full(returned)) => {
                    frame = returned;
                    // The consumer may have emptied a slot meanwhile; then
                    // there is nothing to evict and the retry succeeds.
                    if let Some(old) = self.evict_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        log::warn!("audio queue full, evicted frame #{}", old.sequence());
                        evicted = Some(old.sequence());
                    }
                }
            }
        }
    }
}

/// Consumer half, owned by the session worker.
pub struct FrameReceiver {
    rx: Receiver<AudioFrame>,
    stats: Arc<QueueStats>,
}

impl FrameReceiver {
    /// Waits up to `timeout` for the next frame.
    pub fn pull(&self, timeout: Duration) -> PullOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => PullOutcome::Frame(frame),
            Err(RecvTimeoutError::Timeout) => PullOutcome::Empty,
            Err(RecvTimeoutError::Disconnected) => PullOutcome::Closed,
        }
    }

    /// Number of frames currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.stats.consumer_gone.store(true, Ordering::Release);
    }
}
