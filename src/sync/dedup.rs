//! Keyed in-flight operation de-duplication.
//!
//! At most one operation per key runs at a time. A second
//! [`Deduplicator::execute`] for a key that is still in flight returns
//! [`Dedup::Skipped`] without invoking its operation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::debug;

/// Outcome of [`Deduplicator::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dedup<T> {
    /// The operation ran to completion and produced this value.
    Completed(T),
    /// Another operation for the same key was already in flight.
    Skipped,
}

impl<T> Dedup<T> {
    /// Whether the operation was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The completed value, if the operation ran.
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, Instant>>>;

fn lock_map(map: &InFlight) -> MutexGuard<'_, HashMap<String, Instant>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Skip-duplicate cache of in-flight operations, keyed by string.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    in_flight: InFlight,
}

impl Deduplicator {
    /// Create an empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` unless an operation for `key` is already running.
    ///
    /// The key is deregistered when the operation settles, including when
    /// the returned future is dropped before completion.
    pub async fn execute<F, Fut, T>(&self, key: &str, operation: F) -> Dedup<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        {
            let mut map = lock_map(&self.in_flight);
            if map.contains_key(key) {
                debug!(key, "operation already in flight; skipping");
                return Dedup::Skipped;
            }
            map.insert(key.to_owned(), Instant::now());
        }

        let _entry = EntryGuard {
            key: key.to_owned(),
            map: Arc::clone(&self.in_flight),
        };
        Dedup::Completed(operation().await)
    }

    /// Whether an operation for `key` is currently running.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock_map(&self.in_flight).contains_key(key)
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock_map(&self.in_flight).len()
    }
}

struct EntryGuard {
    key: String,
    map: InFlight,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if let Some(started) = lock_map(&self.map).remove(&self.key) {
            debug!(key = %self.key, elapsed_ms = started.elapsed().as_millis(), "operation settled");
        }
    }
}
