//! Clock abstraction for window math and TTL bookkeeping.
//!
//! Expiry in the in-memory store and the daily-window boundary in the
//! throttle layer both read time through this seam, so tests can drive a
//! simulated clock instead of sleeping through real windows.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Useful for exercising TTL expiry and window rollover deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Advance the clock by the given step.
    pub fn advance(&self, step: Duration) {
        let mut now = self.now.write();
        *now = *now + chrono::Duration::from_std(step).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
