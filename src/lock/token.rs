//! Opaque lock ownership tokens.

use uuid::Uuid;

/// Proof of lease ownership.
///
/// Generated by the lock manager for each acquisition attempt; callers never
/// construct tokens themselves, which keeps uniqueness out of caller hands.
/// Equality against the stored value is the sole ownership test at release
/// and renew time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh cryptographically random token.
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token's wire form, as stored at the lock key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
