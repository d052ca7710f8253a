//! Key-value store adapter: the single coordination medium.
//!
//! Every mutation the lock and throttle layers perform is one atomic
//! store-side operation; caller-side read-modify-write is not part of this
//! surface.

mod adapter;
mod memory;

pub use adapter::{AtomicScript, KeyValueStore, ScriptOutcome};
pub use memory::MemoryStore;
