//! Bounded counters and window math.

use chrono::{DateTime, Days, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::store::{AtomicScript, KeyValueStore};

/// Time until the current UTC day rolls over.
///
/// Quota counter expiry is aligned to this boundary so usage never silently
/// survives into the next window.
pub fn until_day_end(now: DateTime<Utc>) -> Duration {
    let next_midnight = (now.date_naive() + Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    (next_midnight - now).to_std().unwrap_or(Duration::ZERO)
}

/// A floor-at-zero counter shared across replicas.
///
/// Every adjustment is one server-side evaluation of
/// `max(0, current + delta)` with a ttl refresh, so concurrent increments
/// and decrements from different replicas never race past zero or lose
/// updates to independent read-modify-write round trips. Suited to
/// social-graph style counts (followers, following) rather than quota
/// windows.
pub struct BoundedCounter<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> Clone for BoundedCounter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore + ?Sized> BoundedCounter<S> {
    /// Create a bounded counter over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Atomically apply `delta` to the counter at `key`, clamping at zero,
    /// and refresh its lifetime to `window_ttl`. Returns the new value.
    pub async fn adjust(&self, key: &str, delta: i64, window_ttl: Duration) -> Result<i64> {
        let outcome = self
            .store
            .evaluate(AtomicScript::BoundedAdjust {
                key,
                delta,
                ttl: window_ttl,
            })
            .await?;

        outcome.value().ok_or_else(|| {
            TurnstileError::StoreUnavailable("bounded adjustment produced no value".to_string())
        })
    }
}
