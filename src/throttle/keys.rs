//! Usage key generation and namespacing.

use chrono::NaiveDate;

/// Identifies the actor + purpose pair a throttle decision applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    /// The acting identity (a phone number, user id, client id).
    pub actor: String,
    /// What the actor is trying to do (e.g. `login`, `sms_notify`).
    pub purpose: String,
}

impl UsageKey {
    /// Create a new usage key.
    pub fn new(actor: &str, purpose: &str) -> Self {
        Self {
            actor: actor.to_string(),
            purpose: purpose.to_string(),
        }
    }

    /// Storage key of the cooldown marker.
    ///
    /// Format: `cooldown:{actor}:{purpose}`
    pub fn cooldown_key(&self) -> String {
        format!("cooldown:{}:{}", self.actor, self.purpose)
    }

    /// Storage key of the daily quota counter for `day`.
    ///
    /// Format: `quota:{actor}:{purpose}:{yyyymmdd}`. The day discriminator
    /// keeps usage from one window out of the next even if the counter's
    /// expiry were ever lost.
    pub fn quota_key(&self, day: NaiveDate) -> String {
        format!(
            "quota:{}:{}:{}",
            self.actor,
            self.purpose,
            day.format("%Y%m%d")
        )
    }
}

impl std::fmt::Display for UsageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor, self.purpose)
    }
}
