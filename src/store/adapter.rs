//! Store adapter contract.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// A server-side atomic script.
///
/// Each variant executes as a single store-side step: the store observes the
/// key, decides, and mutates with no interleaving window in between. These
/// are the only multi-field operations the coordination layers need; keeping
/// them a closed set makes every backend implement the same semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicScript<'a> {
    /// Delete `key` only if its current value equals `expected`.
    ///
    /// Backs lock release: a lease that expired and was re-acquired under a
    /// different token is never deleted by the stale holder.
    CompareAndDelete {
        /// Key to delete.
        key: &'a str,
        /// Value the key must currently hold.
        expected: &'a str,
    },

    /// Extend the expiry of `key` to `ttl` from now, only if its current
    /// value equals `expected`.
    ///
    /// Backs lease renewal.
    CompareAndExtend {
        /// Key to extend.
        key: &'a str,
        /// Value the key must currently hold.
        expected: &'a str,
        /// New lifetime measured from now.
        ttl: Duration,
    },

    /// Set `key` to `max(0, current + delta)` and refresh its expiry to
    /// `ttl` from now. An absent key counts as zero.
    ///
    /// Backs floor-at-zero counters: concurrent adjustments from different
    /// replicas never race past zero or lose updates.
    BoundedAdjust {
        /// Counter key.
        key: &'a str,
        /// Signed adjustment.
        delta: i64,
        /// Refreshed lifetime measured from now.
        ttl: Duration,
    },
}

/// Result of evaluating an [`AtomicScript`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The compare succeeded and the mutation was applied.
    Matched,
    /// The key was absent or held a different value; nothing was changed.
    Mismatch,
    /// The new counter value after a bounded adjustment.
    Value(i64),
}

impl ScriptOutcome {
    /// Whether a compare-guarded script found its expected value.
    pub fn matched(&self) -> bool {
        matches!(self, ScriptOutcome::Matched)
    }

    /// The counter value produced by a bounded adjustment, if any.
    pub fn value(&self) -> Option<i64> {
        match self {
            ScriptOutcome::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Minimal interface to a single-node-view key-value store.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers of the same key. All methods fail with
/// [`TurnstileError::StoreUnavailable`](crate::error::TurnstileError::StoreUnavailable)
/// when the store cannot be reached; callers decide fail-open or fail-closed
/// per operation.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write `key = value` with the given ttl only if the key is absent.
    /// Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read the value at `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Atomically increment the integer at `key` by one, creating it at 1 if
    /// absent. Returns the new value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set the expiry of an existing key to `ttl` from now. Returns whether
    /// the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining lifetime of `key`, or `None` if the key is absent or has no
    /// expiry.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>>;

    /// Execute a server-side atomic script.
    async fn evaluate(&self, script: AtomicScript<'_>) -> Result<ScriptOutcome>;
}
