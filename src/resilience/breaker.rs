//! Three-state circuit breaker guarding a flaky remote channel.
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN --(attempt after recovery_timeout)--> HALF_OPEN   (attempt runs as probe)
//! HALF_OPEN --(success_threshold successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! The breaker never swallows errors: a failed operation's error is
//! returned unchanged after bookkeeping. Only calls made while the circuit
//! is open are rejected with [`AppError::CircuitOpen`], without running.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Breaker state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// Probe calls are admitted to test recovery.
    HalfOpen,
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Per-breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Channel name; one breaker exists per name.
    pub name: String,
    /// Consecutive failures in `Closed` that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted.
    pub recovery_timeout: Duration,
    /// Successes in `HalfOpen` that close the circuit.
    pub success_threshold: u32,
}

impl BreakerConfig {
    /// Default thresholds for the named channel.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

/// Observable breaker activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    /// The circuit moved between states.
    StateChange {
        /// Breaker name.
        name: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
    /// An admitted operation failed.
    Failure {
        /// Breaker name.
        name: String,
        /// Rendered error of the failed operation.
        error: String,
        /// Failure count after recording this failure.
        failure_count: u32,
    },
    /// An admitted operation succeeded.
    Success {
        /// Breaker name.
        name: String,
        /// Half-open success count after recording this success.
        success_count: u32,
    },
    /// A call was rejected because the circuit is open.
    Rejected {
        /// Breaker name.
        name: String,
        /// State at rejection time.
        state: CircuitState,
    },
}

/// Handle for removing a listener registered with [`CircuitBreaker::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Point-in-time view of a breaker, suitable for status output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count.
    pub failure_count: u32,
    /// Half-open success count.
    pub success_count: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured success threshold.
    pub success_threshold: u32,
    /// Configured recovery timeout in milliseconds.
    pub recovery_timeout_ms: u64,
    /// Wall-clock time of the last recorded failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last recorded success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last state transition.
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            last_transition: Instant::now(),
            last_transition_at: Utc::now(),
        }
    }

    /// Reference point for the recovery timeout: the later of the last
    /// failure and the transition into `Open`.
    fn opened_since(&self) -> Instant {
        self.last_failure
            .map_or(self.last_transition, |failed| failed.max(self.last_transition))
    }
}

/// Failure-isolation wrapper around a remote call.
///
/// Shared by every caller of one channel (see
/// [`BreakerRegistry`](super::registry::BreakerRegistry)), so its state is a
/// process-wide property of that channel.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configured thresholds.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CircuitOpen`] without invoking `operation` when
    /// the circuit is open and the recovery timeout has not elapsed.
    /// Otherwise returns `operation`'s own error unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut events = Vec::new();
        let admitted = {
            let mut inner = self.inner();
            self.admit(&mut inner, &mut events)
        };
        self.emit_all(events);

        if let Err(state) = admitted {
            debug!(breaker = %self.config.name, %state, "call rejected");
            self.emit(&BreakerEvent::Rejected {
                name: self.config.name.clone(),
                state,
            });
            return Err(AppError::CircuitOpen {
                name: self.config.name.clone(),
                state,
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Decide whether a call may proceed, moving `Open` to `HalfOpen` once
    /// the recovery timeout has elapsed.
    fn admit(
        &self,
        inner: &mut Inner,
        events: &mut Vec<BreakerEvent>,
    ) -> std::result::Result<(), CircuitState> {
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if inner.opened_since().elapsed() >= self.config.recovery_timeout {
                    self.transition(inner, CircuitState::HalfOpen, events);
                    Ok(())
                } else {
                    Err(CircuitState::Open)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            inner.last_success_at = Some(Utc::now());
            match inner.state {
                CircuitState::Closed => inner.failure_count = 0,
                CircuitState::HalfOpen => inner.success_count += 1,
                // Late completion of a call admitted before the circuit opened.
                CircuitState::Open => {}
            }
            events.push(BreakerEvent::Success {
                name: self.config.name.clone(),
                success_count: inner.success_count,
            });
            if inner.state == CircuitState::HalfOpen
                && inner.success_count >= self.config.success_threshold
            {
                self.transition(&mut inner, CircuitState::Closed, &mut events);
            }
        }
        self.emit_all(events);
    }

    fn record_failure(&self, err: &AppError) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            inner.last_failure = Some(Instant::now());
            inner.last_failure_at = Some(Utc::now());
            inner.failure_count += 1;
            warn!(
                breaker = %self.config.name,
                state = %inner.state,
                failure_count = inner.failure_count,
                %err,
                "guarded call failed"
            );
            events.push(BreakerEvent::Failure {
                name: self.config.name.clone(),
                error: err.to_string(),
                failure_count: inner.failure_count,
            });
            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    self.transition(&mut inner, CircuitState::Open, &mut events);
                }
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, &mut events);
                }
                _ => {}
            }
        }
        self.emit_all(events);
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, events: &mut Vec<BreakerEvent>) {
        let from = inner.state;
        Self::reset_counters_for(inner, to);
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.last_transition_at = Utc::now();

        if to == CircuitState::Open {
            warn!(breaker = %self.config.name, %from, %to, "circuit opened");
        } else {
            info!(breaker = %self.config.name, %from, %to, "circuit state changed");
        }
        events.push(BreakerEvent::StateChange {
            name: self.config.name.clone(),
            from,
            to,
        });
    }

    fn reset_counters_for(inner: &mut Inner, to: CircuitState) {
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => inner.success_count = 0,
        }
    }

    /// Current state. Does not perform the lazy `Open` → `HalfOpen` move;
    /// that happens on the next attempt.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner().state
    }

    /// Whether a call made now would be admitted.
    #[must_use]
    pub fn is_attemptable(&self) -> bool {
        let inner = self.inner();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner.opened_since().elapsed() >= self.config.recovery_timeout,
        }
    }

    /// Snapshot of state, counters and timestamps.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner();
        BreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_ms: u64::try_from(self.config.recovery_timeout.as_millis())
                .unwrap_or(u64::MAX),
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            last_transition_at: inner.last_transition_at,
        }
    }

    /// Register an event listener. A panicking listener is logged and
    /// otherwise ignored.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a previously registered listener. Returns whether it existed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Move to `state` immediately, applying that state's counter resets.
    pub fn force_state(&self, state: CircuitState) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            self.transition(&mut inner, state, &mut events);
        }
        info!(breaker = %self.config.name, %state, "circuit state forced");
        self.emit_all(events);
    }

    /// Return to a fresh closed breaker, clearing counters and timestamps.
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            self.transition(&mut inner, CircuitState::Closed, &mut events);
            inner.last_failure = None;
            inner.last_failure_at = None;
            inner.last_success_at = None;
        }
        info!(breaker = %self.config.name, "circuit reset");
        self.emit_all(events);
    }

    fn emit_all(&self, events: Vec<BreakerEvent>) {
        for event in &events {
            self.emit(event);
        }
    }

    fn emit(&self, event: &BreakerEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(breaker = %self.config.name, ?event, "breaker event listener panicked");
            }
        }
    }
}
