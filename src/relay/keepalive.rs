//! Idle-input keepalive policy.
//!
//! Streaming recognizers close a connection that receives nothing for a few
//! seconds. The worker consults this scheduler whenever a queue poll times
//! out; the scheduler answers whether a keepalive frame is due.

use crate::relay::clock::{Clock, SystemClock};
use std::time::{Duration, Instant};

/// Decides when a keepalive frame must be sent.
///
/// At most one keepalive is granted per idle window: granting one resets the
/// idle clock, so several back-to-back poll timeouts never produce a burst.
pub struct KeepAliveScheduler<C: Clock = SystemClock> {
    idle_threshold: Duration,
    last_activity: Instant,
    clock: C,
}

impl<C: Clock> KeepAliveScheduler<C> {
    /// Creates a scheduler whose idle clock starts now.
    pub fn with_clock(idle_threshold: Duration, clock: C) -> Self {
        let last_activity = clock.now();
        Self {
            idle_threshold,
            last_activity,
            clock,
        }
    }

    /// Records that real data reached the recognizer.
    pub fn record_activity(&mut self) {
        self.last_activity = self.clock.now();
    }

    /// Time since the last audio frame or keepalive.
    pub fn idle_for(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.last_activity)
    }

    /// Called after a poll returned no audio.
    ///
    /// Returns true when a keepalive should be sent now; the idle clock is
    /// reset in that case whether or not the send later succeeds.
    pub fn on_idle_poll(&mut self) -> bool {
        let now = self.clock.now();
        if now.saturating_duration_since(self.last_activity) >= self.idle_threshold {
            self.last_activity = now;
            true
        } else {
            false
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }
}

impl KeepAliveScheduler<SystemClock> {
    /// Creates a scheduler using the system clock.
    pub fn new(idle_threshold: Duration) -> Self {
        Self::with_clock(idle_threshold, SystemClock)
    }
}
