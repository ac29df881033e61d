//! Responsive per-session interval prompting.
//!
//! One shared poll loop visits every registered session, asks the
//! [`StateDetector`] what the agent is doing, and sends the session's
//! prompt when all three gates pass:
//!
//! 1. the agent is idle or waiting for input,
//! 2. no prompt for this session is still being delivered,
//! 3. at least `min_interval` has passed since the last *successful* send.
//!
//! Gating is time-based rather than edge-triggered: an agent that stays
//! idle across polls is prompted as soon as its interval allows. A failed
//! send does not advance the last-prompt time, so the next poll may retry.
//!
//! The loop starts with the first registration and stops when the last
//! session is removed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::{SessionChannel, StateDetector};
use crate::models::registry::SessionRegistry;
use crate::models::session::Session;
use crate::models::state::AgentState;
use crate::sync::dedup::{Dedup, Deduplicator};
use crate::{AppError, Result};

/// Poll cadence and stop behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between poll ticks.
    pub poll_interval: Duration,
    /// Output lines handed to the state detector.
    pub sample_lines: usize,
    /// Longest time `stop` waits for an in-flight prompt.
    pub drain_timeout: Duration,
    /// How often `stop` re-checks the in-flight flag.
    pub drain_poll: Duration,
    /// Prompt used when a session schedule carries none.
    pub default_prompt: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            sample_lines: 40,
            drain_timeout: Duration::from_secs(30),
            drain_poll: Duration::from_millis(100),
            default_prompt: "Continue working on the current task.".to_owned(),
        }
    }
}

/// Outcome of [`IntervalScheduler::run_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNow {
    /// The prompt was delivered.
    Sent,
    /// A prompt for the session was already in flight.
    AlreadyActive,
}

/// Introspection view of one scheduled session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Session identifier.
    pub session_id: String,
    /// Minimum spacing between prompts.
    pub min_interval_ms: u64,
    /// Prompt text.
    pub prompt: String,
    /// Completion time of the last successful prompt.
    pub last_prompt_at: Option<DateTime<Utc>>,
    /// Remaining time before the interval gate opens.
    pub next_eligible_in_ms: u64,
    /// Classification from the latest poll.
    pub classification: AgentState,
    /// Classification from the poll before that.
    pub previous_classification: Option<AgentState>,
    /// Whether the latest poll found the agent ready.
    pub is_idle: bool,
    /// Whether a prompt is being delivered right now.
    pub active: bool,
    /// Successful deliveries.
    pub prompts_sent: u64,
    /// Failed deliveries.
    pub failed_sends: u64,
    /// Busy to idle transitions seen by the poll loop.
    pub idle_transitions: u64,
    /// When the session was registered.
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    min_interval: Duration,
    prompt: String,
    last_prompt: Option<Instant>,
    last_prompt_at: Option<DateTime<Utc>>,
    classification: AgentState,
    previous: Option<AgentState>,
    is_idle: bool,
    stopping: bool,
    prompts_sent: u64,
    failed_sends: u64,
    idle_transitions: u64,
    registered_at: DateTime<Utc>,
}

impl Entry {
    fn new(min_interval: Duration, prompt: String) -> Self {
        Self {
            min_interval,
            prompt,
            last_prompt: None,
            last_prompt_at: None,
            classification: AgentState::Unknown,
            previous: None,
            is_idle: false,
            stopping: false,
            prompts_sent: 0,
            failed_sends: 0,
            idle_transitions: 0,
            registered_at: Utc::now(),
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.last_prompt.map_or(Duration::ZERO, |last| {
            self.min_interval.saturating_sub(now.saturating_duration_since(last))
        })
    }

    fn status(&self, session_id: &str, active: bool) -> SchedulerStatus {
        SchedulerStatus {
            session_id: session_id.to_owned(),
            min_interval_ms: millis(self.min_interval),
            prompt: self.prompt.clone(),
            last_prompt_at: self.last_prompt_at,
            next_eligible_in_ms: millis(self.remaining(Instant::now())),
            classification: self.classification,
            previous_classification: self.previous,
            is_idle: self.is_idle,
            active,
            prompts_sent: self.prompts_sent,
            failed_sends: self.failed_sends,
            idle_transitions: self.idle_transitions,
            registered_at: self.registered_at,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Entries = Mutex<HashMap<String, Entry>>;

/// Sessions with a prompt being delivered. Kept apart from [`Entries`] so a
/// send outlives the removal of its entry; lock after `entries`, never before.
type InFlight = Mutex<HashSet<String>>;

/// Removes a session from the in-flight set when dropped.
struct ActiveGuard<'a> {
    in_flight: &'a InFlight,
    session_id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(self.session_id);
    }
}

struct Shared {
    channel: Arc<dyn SessionChannel>,
    detector: Arc<dyn StateDetector>,
    config: SchedulerConfig,
    entries: Entries,
    in_flight: InFlight,
    unmanaged: Deduplicator,
}

impl Shared {
    fn is_active(&self, session_id: &str) -> bool {
        lock(&self.in_flight).contains(session_id) || self.unmanaged.is_in_flight(session_id)
    }

    async fn poll_once(self: &Arc<Self>) {
        let ids: Vec<String> = lock(&self.entries).keys().cloned().collect();
        for session_id in ids {
            self.poll_session(session_id).await;
        }
    }

    async fn poll_session(self: &Arc<Self>, session_id: String) {
        let detected = match self
            .detector
            .detect_state(&session_id, self.config.sample_lines)
            .await
        {
            Ok(detected) => detected,
            Err(err) => {
                debug!(session_id, %err, "state detection failed; skipping this poll");
                return;
            }
        };
        let classification = detected.classification();

        let prompt = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(&session_id) else {
                return;
            };

            if entry.classification == AgentState::Busy && classification.is_ready() {
                entry.idle_transitions += 1;
                debug!(session_id, %classification, "session became idle");
            }
            entry.previous = Some(entry.classification);
            entry.classification = classification;
            entry.is_idle = classification.is_ready();

            let due = entry.remaining(Instant::now()).is_zero();
            if entry.is_idle && due && !entry.stopping && self.claim(&session_id) {
                Some(entry.prompt.clone())
            } else {
                None
            }
        };

        if let Some(prompt) = prompt {
            let shared = Arc::clone(self);
            tokio::spawn(
                async move {
                    // Failures are logged by `deliver`; the session stays eligible.
                    let _ = shared.deliver(&session_id, &prompt).await;
                }
                .instrument(info_span!("interval_prompt")),
            );
        }
    }

    /// Mark `session_id` in flight unless a send for it is already running.
    fn claim(&self, session_id: &str) -> bool {
        if self.unmanaged.is_in_flight(session_id) {
            return false;
        }
        lock(&self.in_flight).insert(session_id.to_owned())
    }

    /// Send a prompt for a session the caller has claimed.
    async fn deliver(&self, session_id: &str, prompt: &str) -> Result<()> {
        let _active = ActiveGuard {
            in_flight: &self.in_flight,
            session_id,
        };

        let result = self.channel.send_prompt(session_id, prompt).await;

        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(session_id) {
            match &result {
                Ok(()) => {
                    entry.last_prompt = Some(Instant::now());
                    entry.last_prompt_at = Some(Utc::now());
                    entry.prompts_sent += 1;
                    info!(session_id, prompts_sent = entry.prompts_sent, "prompt delivered");
                }
                Err(err) => {
                    entry.failed_sends += 1;
                    warn!(session_id, %err, "prompt delivery failed; retrying on next eligible poll");
                }
            }
        }
        drop(entries);
        result
    }
}

struct Poller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Interval prompt scheduler for a set of sessions.
pub struct IntervalScheduler {
    shared: Arc<Shared>,
    poller: Mutex<Option<Poller>>,
}

impl IntervalScheduler {
    /// Create a scheduler with no registered sessions.
    #[must_use]
    pub fn new(
        channel: Arc<dyn SessionChannel>,
        detector: Arc<dyn StateDetector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                detector,
                config,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                unmanaged: Deduplicator::new(),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Register `session` for interval prompting.
    ///
    /// Returns `false` without registering when the session has no schedule
    /// or its schedule is invalid; the problem is logged as a warning.
    /// Registering an already managed session updates its interval and
    /// prompt and keeps its timing state.
    pub fn start(&self, session: &Session) -> bool {
        let Some(schedule) = session.schedule.as_ref() else {
            warn!(session_id = %session.id, "session has no prompt schedule; not scheduling");
            return false;
        };
        let (min_interval, prompt) = match schedule.resolve(&self.shared.config.default_prompt) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(session_id = %session.id, %err, "invalid prompt schedule; not scheduling");
                return false;
            }
        };

        {
            let mut entries = lock(&self.shared.entries);
            if let Some(entry) = entries.get_mut(&session.id) {
                entry.min_interval = min_interval;
                entry.prompt = prompt;
                entry.stopping = false;
                info!(session_id = %session.id, interval_s = min_interval.as_secs(), "schedule updated");
            } else {
                entries.insert(session.id.clone(), Entry::new(min_interval, prompt));
                info!(session_id = %session.id, interval_s = min_interval.as_secs(), "session scheduled");
            }
        }

        self.ensure_polling();
        true
    }

    /// Unregister a session, first waiting (bounded) for an in-flight prompt
    /// to finish. Returns `false` if the session was not managed.
    pub async fn stop(&self, session_id: &str) -> bool {
        {
            let mut entries = lock(&self.shared.entries);
            match entries.get_mut(session_id) {
                Some(entry) => entry.stopping = true,
                None => return false,
            }
        }

        let deadline = Instant::now() + self.shared.config.drain_timeout;
        loop {
            if !lock(&self.shared.in_flight).contains(session_id) {
                break;
            }
            if Instant::now() >= deadline {
                warn!(session_id, "prompt still in flight after drain timeout; removing anyway");
                break;
            }
            tokio::time::sleep(self.shared.config.drain_poll).await;
        }

        lock(&self.shared.entries).remove(session_id);
        info!(session_id, "session unscheduled");
        self.stop_polling_if_empty().await;
        true
    }

    /// Stop and start again with the session's current schedule.
    pub async fn restart(&self, session: &Session) -> bool {
        self.stop(&session.id).await;
        self.start(session)
    }

    /// Register every scheduled session in `registry`. Returns how many
    /// were registered.
    pub async fn start_all(&self, registry: &SessionRegistry) -> usize {
        let sessions = registry.list().await;
        let mut started = 0;
        for session in sessions.iter().filter(|s| s.schedule.is_some()) {
            if self.start(session) {
                started += 1;
            }
        }
        info!(started, total = sessions.len(), "scheduled sessions from registry");
        started
    }

    /// Unregister every session, draining in-flight prompts concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.shared.entries).keys().cloned().collect();
        join_all(ids.iter().map(|id| self.stop(id))).await;
        self.stop_polling_if_empty().await;
    }

    /// Whether `session_id` is registered.
    #[must_use]
    pub fn is_managed(&self, session_id: &str) -> bool {
        lock(&self.shared.entries).contains_key(session_id)
    }

    /// Status of one registered session.
    #[must_use]
    pub fn status(&self, session_id: &str) -> Option<SchedulerStatus> {
        lock(&self.shared.entries)
            .get(session_id)
            .map(|entry| entry.status(session_id, self.shared.is_active(session_id)))
    }

    /// Status of every registered session, ordered by id.
    #[must_use]
    pub fn all_status(&self) -> Vec<SchedulerStatus> {
        let mut all: Vec<SchedulerStatus> = lock(&self.shared.entries)
            .iter()
            .map(|(id, entry)| entry.status(id, self.shared.is_active(id)))
            .collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Whether the shared poll loop is running.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        lock(&self.poller)
            .as_ref()
            .is_some_and(|poller| !poller.handle.is_finished())
    }

    /// Send the session's prompt immediately, ignoring the interval gate.
    ///
    /// A prompt already in flight for the session is never overlapped.
    /// For unmanaged sessions the prompt comes from the session schedule or
    /// the configured default.
    ///
    /// # Errors
    ///
    /// Returns the delivery error from the channel, or `AppError::Config`
    /// if no prompt text is available.
    pub async fn run_now(&self, session: &Session) -> Result<RunNow> {
        let managed_prompt = {
            let entries = lock(&self.shared.entries);
            match entries.get(&session.id) {
                Some(entry) if entry.stopping || !self.shared.claim(&session.id) => {
                    return Ok(RunNow::AlreadyActive)
                }
                Some(entry) => Some(entry.prompt.clone()),
                None => None,
            }
        };

        if let Some(prompt) = managed_prompt {
            info!(session_id = %session.id, "manual prompt requested");
            self.shared.deliver(&session.id, &prompt).await?;
            return Ok(RunNow::Sent);
        }

        let prompt = session
            .schedule
            .as_ref()
            .and_then(|schedule| schedule.prompt.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(self.shared.config.default_prompt.trim())
            .to_owned();
        if prompt.is_empty() {
            return Err(AppError::Config(format!(
                "no prompt text for session {}",
                session.id
            )));
        }

        if lock(&self.shared.in_flight).contains(&session.id) {
            return Ok(RunNow::AlreadyActive);
        }
        info!(session_id = %session.id, "manual prompt requested for unscheduled session");
        match self
            .shared
            .unmanaged
            .execute(&session.id, || {
                self.shared.channel.send_prompt(&session.id, &prompt)
            })
            .await
        {
            Dedup::Completed(result) => result.map(|()| RunNow::Sent),
            Dedup::Skipped => Ok(RunNow::AlreadyActive),
        }
    }

    fn ensure_polling(&self) {
        let mut poller = lock(&self.poller);
        if poller.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let interval = self.shared.config.poll_interval;
        let token = cancel.clone();
        let handle = tokio::spawn(
            async move {
                loop {
                    shared.poll_once().await;
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("poll loop shutting down");
                            break;
                        }
                        () = tokio::time::sleep(interval) => {}
                    }
                }
            }
            .instrument(info_span!("prompt_scheduler")),
        );
        *poller = Some(Poller { cancel, handle });
        info!(poll_interval_ms = millis(interval), "poll loop started");
    }

    async fn stop_polling_if_empty(&self) {
        let poller = {
            let mut poller = lock(&self.poller);
            if !lock(&self.shared.entries).is_empty() {
                return;
            }
            poller.take()
        };
        if let Some(poller) = poller {
            poller.cancel.cancel();
            let _ = poller.handle.await;
            info!("poll loop stopped");
        }
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.cancel.cancel();
        }
    }
}
