//! Time source for every scheduled completion, accumulation and timeout.
//!
//! Core components never call `Utc::now()` directly; they take an
//! `Arc<dyn Clock>` so tests and replays can drive time by hand.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never runs backwards.
///
/// The wall time is sampled once at construction; afterwards the reading
/// advances by the monotonic [`Instant`] elapsed since then, so system clock
/// adjustments cannot move a task's completion backwards or forwards.
#[derive(Debug)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor_instant: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.anchor_instant.elapsed()).unwrap_or(Duration::zero());
        self.anchor_wall + elapsed
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// A clock starting at the Unix epoch, convenient for scenarios that count
    /// seconds from zero.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    /// Move to `to`. Ignored if `to` lies in the past.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_only_forward() {
        let clock = ManualClock::at_epoch();
        clock.advance_secs(30);
        assert_eq!(clock.now().timestamp(), 30);

        clock.set(DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(clock.now().timestamp(), 30);
    }
}
