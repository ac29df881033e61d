//! Session liveness and channel connectivity monitoring.
//!
//! Two independent loops share one [`HealthMonitor`]:
//!
//! - the **liveness loop** asks the channel whether every tracked session
//!   still exists, maintains staleness from recorded output activity, and
//!   flips registry status between `Error` and `Idle` as sessions vanish
//!   and reappear;
//! - the **ping loop** probes the channel itself and declares it
//!   disconnected after consecutive failures.
//!
//! Each loop re-arms its timer only after the previous tick completed, and
//! publishes a [`HealthReport`] to subscribers after every tick.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::SessionChannel;
use crate::models::registry::SessionRegistry;
use crate::models::session::{Liveness, Session, SessionStatus};
use crate::sync::dedup::{Dedup, Deduplicator};
use crate::{AppError, Result};

/// Loop cadence and thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Interval between liveness sweeps.
    pub session_interval: Duration,
    /// Interval between channel pings.
    pub ping_interval: Duration,
    /// Silence after which a session is reported stale.
    pub stale_threshold: Duration,
    /// Consecutive ping failures that mark the channel disconnected.
    pub ping_failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            session_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(15 * 60),
            ping_failure_threshold: 3,
        }
    }
}

/// Health of one tracked session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionHealth {
    /// Session identifier.
    pub session_id: String,
    /// Outcome of the last successful existence check.
    pub has_session: Option<bool>,
    /// Last observed output.
    pub last_activity: Option<DateTime<Utc>>,
    /// Time since the last output, or since tracking began.
    pub time_since_activity_ms: u64,
    /// Whether the session has been silent past the stale threshold.
    pub is_stale: bool,
    /// Existence checks that failed to reach the channel.
    pub poller_errors: u32,
    /// Error from the most recent failed check.
    pub last_error: Option<String>,
    /// Time of the most recent check attempt.
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Connectivity of the channel itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelHealth {
    /// Whether the channel is considered reachable.
    pub connected: bool,
    /// Time of the most recent ping attempt.
    pub last_ping_at: Option<DateTime<Utc>>,
    /// Pings failed in a row.
    pub consecutive_failures: u32,
    /// Error from the most recent failed ping.
    pub last_error: Option<String>,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            connected: true,
            last_ping_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// State published to subscribers after every loop tick.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    /// Per-session health, ordered by session id.
    pub sessions: Vec<SessionHealth>,
    /// Channel connectivity.
    pub channel: ChannelHealth,
}

type Subscriber = Arc<dyn Fn(&HealthReport) + Send + Sync>;

#[derive(Debug)]
struct SessionRecord {
    health: SessionHealth,
    tracked_since: Instant,
    last_activity: Option<Instant>,
}

impl SessionRecord {
    fn new(session_id: &str) -> Self {
        Self {
            health: SessionHealth {
                session_id: session_id.to_owned(),
                has_session: None,
                last_activity: None,
                time_since_activity_ms: 0,
                is_stale: false,
                poller_errors: 0,
                last_error: None,
                last_checked_at: None,
            },
            tracked_since: Instant::now(),
            last_activity: None,
        }
    }

    fn refresh_staleness(&mut self, threshold: Duration) {
        let silent = self.last_activity.unwrap_or(self.tracked_since).elapsed();
        self.health.time_since_activity_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX);
        self.health.is_stale = silent > threshold;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    channel: Arc<dyn SessionChannel>,
    registry: SessionRegistry,
    config: HealthConfig,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    channel_health: Mutex<ChannelHealth>,
    subscribers: Mutex<Vec<Subscriber>>,
    on_demand: Deduplicator,
}

impl Shared {
    async fn sweep_sessions(&self) {
        let sessions = self.registry.list().await;
        {
            let mut records = lock(&self.sessions);
            records.retain(|id, _| sessions.iter().any(|s| &s.id == id));
        }

        for session in sessions.iter().filter(|s| !s.is_launching()) {
            self.check_session(session).await;
        }
        self.publish();
    }

    async fn check_session(&self, session: &Session) -> SessionHealth {
        let result = self.channel.check_session_exists(&session.id).await;

        let health = {
            let mut records = lock(&self.sessions);
            let record = records
                .entry(session.id.clone())
                .or_insert_with(|| SessionRecord::new(&session.id));
            record.health.last_checked_at = Some(Utc::now());
            match &result {
                Ok(exists) => {
                    record.health.has_session = Some(*exists);
                    record.health.last_error = None;
                }
                Err(err) => {
                    // Unreachable channel says nothing about the session.
                    record.health.poller_errors += 1;
                    record.health.last_error = Some(err.to_string());
                }
            }
            record.refresh_staleness(self.config.stale_threshold);
            record.health.clone()
        };

        match result {
            Ok(true) => {
                self.registry.set_liveness(&session.id, Liveness::Alive).await;
                if session.status == SessionStatus::Error && session.liveness == Liveness::Missing {
                    info!(session_id = %session.id, "session reappeared");
                    self.registry.set_status(&session.id, SessionStatus::Idle).await;
                }
            }
            Ok(false) => {
                self.registry.set_liveness(&session.id, Liveness::Missing).await;
                // A deliberately stopped session keeps its status.
                if !matches!(session.status, SessionStatus::Error | SessionStatus::Stopped) {
                    warn!(session_id = %session.id, previous = ?session.status, "session disappeared");
                    self.registry.set_status(&session.id, SessionStatus::Error).await;
                }
            }
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    poller_errors = health.poller_errors,
                    %err,
                    "session existence check failed"
                );
            }
        }
        health
    }

    async fn ping(&self) {
        let result = self.channel.check_channel_health().await;

        {
            let mut channel = lock(&self.channel_health);
            channel.last_ping_at = Some(Utc::now());
            match result {
                Ok(true) => {
                    if !channel.connected {
                        info!("channel reconnected");
                    }
                    channel.connected = true;
                    channel.consecutive_failures = 0;
                    channel.last_error = None;
                }
                other => {
                    channel.consecutive_failures += 1;
                    channel.last_error = Some(match other {
                        Err(err) => err.to_string(),
                        Ok(_) => "channel reported unhealthy".to_owned(),
                    });
                    debug!(
                        consecutive_failures = channel.consecutive_failures,
                        "channel ping failed"
                    );
                    if channel.connected
                        && channel.consecutive_failures >= self.config.ping_failure_threshold
                    {
                        channel.connected = false;
                        warn!(
                            consecutive_failures = channel.consecutive_failures,
                            "channel disconnected"
                        );
                    }
                }
            }
        }
        self.publish();
    }

    fn report(&self) -> HealthReport {
        let mut sessions: Vec<SessionHealth> = {
            let mut records = lock(&self.sessions);
            records
                .values_mut()
                .map(|record| {
                    record.refresh_staleness(self.config.stale_threshold);
                    record.health.clone()
                })
                .collect()
        };
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        HealthReport {
            sessions,
            channel: lock(&self.channel_health).clone(),
        }
    }

    fn publish(&self) {
        let subscribers: Vec<Subscriber> = lock(&self.subscribers).clone();
        if subscribers.is_empty() {
            return;
        }
        let report = self.report();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&report))).is_err() {
                warn!("health subscriber panicked");
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Periodic liveness and connectivity checks over a [`SessionChannel`].
pub struct HealthMonitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(
        channel: Arc<dyn SessionChannel>,
        registry: SessionRegistry,
        config: HealthConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                registry,
                config,
                sessions: Mutex::new(HashMap::new()),
                channel_health: Mutex::new(ChannelHealth::default()),
                subscribers: Mutex::new(Vec::new()),
                on_demand: Deduplicator::new(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start both loops. Returns `false` if they are already running.
    ///
    /// Each loop runs its first tick immediately.
    pub fn start(&self) -> bool {
        let mut running = lock(&self.running);
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let liveness = spawn_loop(
            Arc::clone(&self.shared),
            self.shared.config.session_interval,
            cancel.clone(),
            LoopKind::Liveness,
        );
        let ping = spawn_loop(
            Arc::clone(&self.shared),
            self.shared.config.ping_interval,
            cancel.clone(),
            LoopKind::Ping,
        );
        *running = Some(Running {
            cancel,
            handles: vec![liveness, ping],
        });
        info!(
            session_interval_s = self.shared.config.session_interval.as_secs(),
            ping_interval_s = self.shared.config.ping_interval.as_secs(),
            "health monitor started"
        );
        true
    }

    /// Stop both loops and wait for any in-progress tick to finish.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            for handle in running.handles {
                let _ = handle.await;
            }
            info!("health monitor stopped");
        }
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Record that `session_id` produced output. Feeds staleness only.
    pub async fn record_activity(&self, session_id: &str) {
        let now = Utc::now();
        {
            let mut records = lock(&self.shared.sessions);
            let record = records
                .entry(session_id.to_owned())
                .or_insert_with(|| SessionRecord::new(session_id));
            record.last_activity = Some(Instant::now());
            record.health.last_activity = Some(now);
            record.refresh_staleness(self.shared.config.stale_threshold);
        }
        self.shared.registry.touch_activity(session_id, now).await;
    }

    /// Run one liveness check for `session_id` immediately.
    ///
    /// Returns [`Dedup::Skipped`] if a manual check for the same session is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not in the registry.
    pub async fn check_now(&self, session_id: &str) -> Result<Dedup<SessionHealth>> {
        let session = self
            .shared
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;

        let outcome = self
            .shared
            .on_demand
            .execute(session_id, || self.shared.check_session(&session))
            .await;
        if !outcome.is_skipped() {
            self.shared.publish();
        }
        Ok(outcome)
    }

    /// Register a subscriber for published reports. A panicking subscriber
    /// is logged and otherwise ignored.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&HealthReport) + Send + Sync + 'static,
    {
        lock(&self.shared.subscribers).push(Arc::new(subscriber));
    }

    /// Current health of one session, if it has been tracked.
    #[must_use]
    pub fn session_health(&self, session_id: &str) -> Option<SessionHealth> {
        let mut records = lock(&self.shared.sessions);
        records.get_mut(session_id).map(|record| {
            record.refresh_staleness(self.shared.config.stale_threshold);
            record.health.clone()
        })
    }

    /// Current channel connectivity.
    #[must_use]
    pub fn channel_health(&self) -> ChannelHealth {
        lock(&self.shared.channel_health).clone()
    }

    /// Full current report.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        self.shared.report()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Liveness,
    Ping,
}

fn spawn_loop(
    shared: Arc<Shared>,
    interval: Duration,
    cancel: CancellationToken,
    kind: LoopKind,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                match kind {
                    LoopKind::Liveness => shared.sweep_sessions().await,
                    LoopKind::Ping => shared.ping().await,
                }
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("health loop shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
        .instrument(info_span!("health_monitor", kind = ?kind)),
    )
}
