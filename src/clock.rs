//! Clock abstraction so every time-dependent decision can be faked in tests.
//!
//! Two readings are deliberately kept apart: `now_wall` feeds anything that
//! is serialized (item timestamps, spill file names), `now_mono` feeds
//! deadline arithmetic (circuit cooldowns) and never goes backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Wall-clock reading, for serialization.
    fn now_wall(&self) -> SystemTime;

    /// Monotonic milliseconds since some fixed origin, for deadlines.
    fn now_mono(&self) -> u64;
}

/// Production clock: wall time from the OS, monotonic time from `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_wall(&self) -> SystemTime {
        SystemTime::now()
    }

    fn now_mono(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-cranked clock for deterministic tests. Both readings advance
/// together.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) {
        self.millis.fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_wall(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn now_mono(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_readings() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_mono(), 0);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now_mono(), 90_000);
        assert_eq!(
            clock.now_wall().duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::default();
        let a = clock.now_mono();
        let b = clock.now_mono();
        assert!(b >= a);
    }
}
