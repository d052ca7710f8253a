//! Error types for the Turnstile library.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Lock contention, quota denials, and cooldown blocks are ordinary return
/// values, not errors; only store faults and bounded-wait outcomes surface
/// here.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The underlying key-value store could not be reached or evaluated.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The lease is absent or held by a different token at release time.
    ///
    /// Not fatal: it signals the lease was already lost, typically because
    /// it expired and was re-acquired before the holder released it.
    #[error("Lease for {key} is absent or held by another token")]
    LockMismatch {
        /// The storage key of the lost lease.
        key: String,
    },

    /// The bounded wait in a blocking acquire elapsed without success.
    #[error("Timed out after {waited:?} waiting for lock {key}")]
    Timeout {
        /// The storage key that stayed contended.
        key: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The caller's cancellation signal fired before the lock was acquired.
    #[error("Acquisition of lock {key} was cancelled")]
    Cancelled {
        /// The storage key the caller was waiting on.
        key: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
