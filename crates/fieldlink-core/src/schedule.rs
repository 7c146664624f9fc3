// ── Cycle scheduling helpers ──
//
// Re-entrancy guards for periodic work, and alignment of timers to
// wall-clock multiples so restarts do not drift the schedule.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Flag marking a periodic cycle as in progress.
///
/// A tick that finds the guard held is skipped, not queued, so slow
/// cycles shed beats instead of piling up.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    active: Arc<AtomicBool>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard. Returns `None` while a previous cycle is active.
    pub fn try_enter(&self) -> Option<CycleToken> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken {
                active: Arc::clone(&self.active),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases its [`CycleGuard`] on drop. Can be moved into spawned work.
#[derive(Debug)]
pub struct CycleToken {
    active: Arc<AtomicBool>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Delay from `now` until the next whole multiple of `interval` since
/// the Unix epoch. A zero interval yields a zero delay.
pub fn next_aligned(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
    let remainder = now_ms % interval_ms;
    if remainder == 0 {
        return interval;
    }
    Duration::from_millis(interval_ms - remainder)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn guard_rejects_second_entry_until_released() {
        let guard = CycleGuard::new();
        let token = guard.try_enter().unwrap();
        assert!(guard.try_enter().is_none());
        assert!(guard.is_active());
        drop(token);
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn alignment_targets_next_multiple() {
        let now = Utc.timestamp_millis_opt(3_725_000).unwrap();
        let delay = next_aligned(now, Duration::from_secs(3600));
        assert_eq!(delay, Duration::from_millis(3_475_000));
    }

    #[test]
    fn exact_multiple_waits_a_full_interval() {
        let now = Utc.timestamp_millis_opt(60_000).unwrap();
        assert_eq!(next_aligned(now, Duration::from_secs(60)), Duration::from_secs(60));
    }
}
