//! Time source for the idle policies, replaceable in tests.

use std::time::{Duration, Instant};

/// Stand-in for "never" when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deadline `timeout` from now, saturating instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_adds_timeout() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::from_millis(500));
        assert!(deadline >= before + Duration::from_millis(500));
        assert!(deadline <= Instant::now() + Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_after_saturates_huge_timeout() {
        let deadline = deadline_after(Duration::from_millis(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86_400));
    }
}
