//! Keyed registry of shared circuit breakers.
//!
//! Constructed once at the application root and passed by reference to
//! every consumer, so each channel name maps to exactly one
//! [`CircuitBreaker`] for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};

/// Process-wide `name → breaker` map.
#[derive(Debug, Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<BTreeMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn breakers(&self) -> MutexGuard<'_, BTreeMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the breaker for `config.name`, creating it on first use.
    ///
    /// An existing breaker keeps the thresholds it was created with.
    #[must_use]
    pub fn get_or_create(&self, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers();
        if let Some(existing) = breakers.get(&config.name) {
            if existing.config() != &config {
                debug!(breaker = %config.name, "breaker exists; ignoring new thresholds");
            }
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(config));
        breakers.insert(breaker.name().to_owned(), Arc::clone(&breaker));
        breaker
    }

    /// Look up an existing breaker.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers().get(name).cloned()
    }

    /// Snapshots of all breakers, ordered by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers().values().map(|b| b.snapshot()).collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
