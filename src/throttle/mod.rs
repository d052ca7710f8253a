//! Usage throttling over expiring counters.
//!
//! Answers "may actor X proceed for purpose P" across replicas using only
//! the store's atomic primitives. The lock manager is deliberately not
//! involved on this path: per-counter atomicity needs a single atomic op,
//! not cross-key exclusivity.

mod counter;
mod keys;
mod limiter;

pub use counter::{until_day_end, BoundedCounter};
pub use keys::UsageKey;
pub use limiter::{CooldownDecision, QuotaDecision, UsageLimiter};
