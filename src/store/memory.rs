//! In-memory store implementation.
//!
//! Backs single-process deployments and serves as the contract test double
//! for the lock and throttle layers. Expiry is lazy: entries past their
//! deadline are treated as absent and reaped on access. Per-key atomicity
//! comes from the map's entry guards.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

use super::adapter::{AtomicScript, KeyValueStore, ScriptOutcome};

/// A stored value with an optional expiry deadline.
#[derive(Debug, Clone)]
struct StoredEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(value: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.to_string(),
            expires_at,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn as_int(&self) -> Result<i64> {
        self.value.parse().map_err(|_| {
            TurnstileError::StoreUnavailable(format!(
                "value is not an integer: {:?}",
                self.value
            ))
        })
    }
}

/// An in-memory key-value store with TTL semantics.
///
/// Thread-safe and cheap to share behind an `Arc`. Time is read through the
/// injected [`Clock`], so tests can expire keys by advancing a manual clock.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store running on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store running on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live entries. Primarily useful for tests.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deadline(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// Reap `key` if it has expired, so subsequent ops see it as absent.
    fn purge_expired(&self, key: &str, now: DateTime<Utc>) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let deadline = self.deadline(now, ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(StoredEntry::new(value, Some(deadline)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredEntry::new(value, Some(deadline)));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        self.purge_expired(key, now);
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        self.purge_expired(key, now);
        Ok(u64::from(self.entries.remove(key).is_some()))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(StoredEntry::new("1", None));
                    return Ok(1);
                }
                let next = slot.get().as_int()? + 1;
                slot.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredEntry::new("1", None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        self.purge_expired(key, now);

        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(self.deadline(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        self.purge_expired(key, now);

        let remaining = self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
        });
        Ok(remaining)
    }

    async fn evaluate(&self, script: AtomicScript<'_>) -> Result<ScriptOutcome> {
        let now = self.clock.now();

        match script {
            AtomicScript::CompareAndDelete { key, expected } => {
                self.purge_expired(key, now);
                let removed = self
                    .entries
                    .remove_if(key, |_, entry| entry.value == expected);
                Ok(if removed.is_some() {
                    ScriptOutcome::Matched
                } else {
                    ScriptOutcome::Mismatch
                })
            }
            AtomicScript::CompareAndExtend { key, expected, ttl } => {
                self.purge_expired(key, now);
                match self.entries.get_mut(key) {
                    Some(mut entry) if entry.value == expected => {
                        entry.expires_at = Some(self.deadline(now, ttl));
                        Ok(ScriptOutcome::Matched)
                    }
                    _ => Ok(ScriptOutcome::Mismatch),
                }
            }
            AtomicScript::BoundedAdjust { key, delta, ttl } => {
                let deadline = self.deadline(now, ttl);
                match self.entries.entry(key.to_string()) {
                    Entry::Occupied(mut slot) => {
                        let current = if slot.get().is_expired(now) {
                            0
                        } else {
                            slot.get().as_int()?
                        };
                        let next = (current + delta).max(0);
                        slot.insert(StoredEntry::new(&next.to_string(), Some(deadline)));
                        Ok(ScriptOutcome::Value(next))
                    }
                    Entry::Vacant(slot) => {
                        let next = delta.max(0);
                        slot.insert(StoredEntry::new(&next.to_string(), Some(deadline)));
                        Ok(ScriptOutcome::Value(next))
                    }
                }
            }
        }
    }
}
