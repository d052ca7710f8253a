//! Usage limiter: cooldown and daily quota decisions.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::KeyValueStore;

use super::counter::until_day_end;
use super::keys::UsageKey;

/// Outcome of a cooldown check.
#[derive(Debug, Clone)]
pub struct CooldownDecision {
    /// Whether the actor must wait before acting again.
    pub blocked: bool,
    /// Remaining cooldown when blocked.
    pub retry_after: Option<Duration>,
    /// True when the store could not be consulted and the decision failed
    /// open. Callers should log degraded decisions; the underlying fault is
    /// also logged here.
    pub degraded: bool,
}

/// Outcome of a daily quota check.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    /// Whether the actor is still under the limit for the current window.
    pub allowed: bool,
    /// Usage recorded so far in the window.
    pub current: u64,
    /// The limit the check was made against.
    pub limit: u64,
    /// Usages left before the limit is reached.
    pub remaining: u64,
    /// True when the store could not be consulted and the decision failed
    /// open.
    pub degraded: bool,
}

/// Tracks per-actor usage in two windows: a short cooldown interval and a
/// rolling daily quota.
///
/// Check and record are deliberately decoupled best-effort operations, which
/// makes the quota a soft limit: two replicas can both pass a check before
/// either records, briefly exceeding the limit by the concurrency width.
/// Callers that need a hard limit should serialize the pair with a
/// [`LockManager`](crate::lock::LockManager) section or keep their count in
/// a [`BoundedCounter`](super::BoundedCounter).
pub struct UsageLimiter<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore + ?Sized> Clone for UsageLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: KeyValueStore + ?Sized> UsageLimiter<S> {
    /// Create a limiter running on the system clock.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a limiter running on the given clock.
    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Check whether the actor is inside the cooldown interval for a
    /// purpose.
    ///
    /// A store read failure degrades to `blocked = false`: a transient
    /// outage must not halt the business flow. The decision carries a
    /// `degraded` flag so the caller can see the enforcement gap.
    pub async fn check_cooldown(&self, actor: &str, purpose: &str) -> CooldownDecision {
        let key = UsageKey::new(actor, purpose);
        let marker = key.cooldown_key();

        trace!(key = %key, "Checking cooldown");

        match self.store.time_to_live(&marker).await {
            Ok(Some(remaining)) => {
                debug!(key = %key, retry_after = ?remaining, "Cooldown active");
                CooldownDecision {
                    blocked: true,
                    retry_after: Some(remaining),
                    degraded: false,
                }
            }
            Ok(None) => CooldownDecision {
                blocked: false,
                retry_after: None,
                degraded: false,
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Cooldown check failed, failing open");
                CooldownDecision {
                    blocked: false,
                    retry_after: None,
                    degraded: true,
                }
            }
        }
    }

    /// Check whether the actor is under `limit` for the current UTC day.
    ///
    /// Fail-open on store read errors, mirroring cooldown semantics. Once
    /// the window's count reaches the limit, every further check is denied
    /// until the window expires.
    pub async fn check_daily_quota(&self, actor: &str, purpose: &str, limit: u64) -> QuotaDecision {
        let key = UsageKey::new(actor, purpose);
        let counter = key.quota_key(self.clock.now().date_naive());

        trace!(key = %key, limit = limit, "Checking daily quota");

        match self.store.get(&counter).await {
            Ok(value) => {
                let current: u64 = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                let allowed = current < limit;
                if !allowed {
                    debug!(key = %key, current = current, limit = limit, "Daily quota exceeded");
                }
                QuotaDecision {
                    allowed,
                    current,
                    limit,
                    remaining: limit.saturating_sub(current),
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Daily quota check failed, failing open");
                QuotaDecision {
                    allowed: true,
                    current: 0,
                    limit,
                    remaining: limit,
                    degraded: true,
                }
            }
        }
    }

    /// Record one usage: set the cooldown marker and bump the daily
    /// counter, aligning the counter's expiry to the end of the current UTC
    /// day on its first increment.
    ///
    /// Both updates are independent best-effort operations. The business
    /// action has already happened by the time this is called, so failures
    /// are logged as potential quota leakage and never escalated.
    pub async fn record_usage(&self, actor: &str, purpose: &str, cooldown_ttl: Duration) {
        let key = UsageKey::new(actor, purpose);
        let now = self.clock.now();

        if let Err(e) = self
            .store
            .set_if_absent(&key.cooldown_key(), "1", cooldown_ttl)
            .await
        {
            warn!(key = %key, error = %e, "Failed to set cooldown marker");
        }

        let counter = key.quota_key(now.date_naive());
        match self.store.increment(&counter).await {
            Ok(1) => {
                // First usage of the window: pin the counter to the day
                // boundary.
                let ttl = until_day_end(now);
                if let Err(e) = self.store.expire(&counter, ttl).await {
                    warn!(key = %key, error = %e, "Failed to set quota window expiry, count may leak into the next window");
                }
            }
            Ok(count) => {
                trace!(key = %key, count = count, "Recorded usage");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to record usage, potential quota leakage");
            }
        }
    }
}
