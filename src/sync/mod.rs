//! Async coordination primitives.
//!
//! [`FifoLock`] serializes access in arrival order and [`Deduplicator`]
//! drops duplicate operations while one for the same key is in flight.

pub mod dedup;
pub mod lock;

pub use dedup::{Dedup, Deduplicator};
pub use lock::{FifoLock, LockGuard};
