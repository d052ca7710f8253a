//! Distributed lease-based locking.
//!
//! Serializes access to named resources across any number of processes,
//! using only the shared store as coordination medium. Leases auto-expire;
//! ownership is proven by token equality, never by caller identity.

mod manager;
mod token;

pub use manager::{
    AcquireOptions, Lease, LockManager, DEFAULT_LEASE_TTL, DEFAULT_MAX_WAIT,
    DEFAULT_RETRY_INTERVAL,
};
pub use token::LockToken;
