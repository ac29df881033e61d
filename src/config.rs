//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{PatternClassifier, TmuxConfig};
use crate::models::session::{PromptSchedule, Session, SessionStatus};
use crate::orchestrator::health_monitor::HealthConfig;
use crate::orchestrator::prompt_scheduler::SchedulerConfig;
use crate::orchestrator::provisioner::{ProvisionerConfig, SessionRequest};
use crate::resilience::breaker::BreakerConfig;
use crate::{AppError, Result};

/// Circuit breaker thresholds shared by every breaker the binary builds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BreakerSection {
    /// Consecutive failures that open a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial call.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Trial successes that close a half-open circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

/// Health monitor cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthSection {
    /// Seconds between session liveness sweeps.
    #[serde(default = "default_session_interval")]
    pub session_interval_seconds: u64,
    /// Seconds between channel pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    /// Seconds of silence before a session is reported stale.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_seconds: u64,
    /// Consecutive ping failures before the channel is marked disconnected.
    #[serde(default = "default_ping_failure_threshold")]
    pub ping_failure_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            session_interval_seconds: default_session_interval(),
            ping_interval_seconds: default_ping_interval(),
            stale_threshold_seconds: default_stale_threshold(),
            ping_failure_threshold: default_ping_failure_threshold(),
        }
    }
}

fn default_session_interval() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    10
}

fn default_stale_threshold() -> u64 {
    900
}

fn default_ping_failure_threshold() -> u32 {
    3
}

/// Interval scheduler cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerSection {
    /// Milliseconds between poll ticks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Output lines sampled for state detection.
    #[serde(default = "default_sample_lines")]
    pub sample_lines: usize,
    /// Longest wait for an in-flight prompt when unscheduling.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Re-check period while draining.
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,
    /// Prompt used by sessions that configure none.
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            sample_lines: default_sample_lines(),
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_ms: default_drain_poll_ms(),
            default_prompt: default_prompt(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_sample_lines() -> usize {
    40
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_drain_poll_ms() -> u64 {
    100
}

fn default_prompt() -> String {
    "Continue working on the current task.".into()
}

/// Batch provisioning retry policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProvisionerSection {
    /// Sequential retry rounds after the first concurrent pass.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry round; doubles per round.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for ProvisionerSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// tmux invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TmuxSection {
    /// tmux executable.
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    /// Dedicated server socket name.
    #[serde(default)]
    pub socket_name: Option<String>,
    /// Command started in every new session (e.g. the agent CLI).
    #[serde(default)]
    pub launch_command: Option<String>,
}

impl Default for TmuxSection {
    fn default() -> Self {
        Self {
            binary: default_tmux_binary(),
            socket_name: None,
            launch_command: None,
        }
    }
}

fn default_tmux_binary() -> String {
    "tmux".into()
}

/// Regular expressions used to classify captured pane output.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DetectorSection {
    /// Last-line patterns of an agent ready for input.
    #[serde(default = "default_idle_patterns")]
    pub idle_patterns: Vec<String>,
    /// Patterns of a question awaiting an answer.
    #[serde(default = "default_waiting_patterns")]
    pub waiting_patterns: Vec<String>,
    /// Patterns of work in progress.
    #[serde(default = "default_busy_patterns")]
    pub busy_patterns: Vec<String>,
    /// Patterns of a reported failure.
    #[serde(default = "default_error_patterns")]
    pub error_patterns: Vec<String>,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            idle_patterns: default_idle_patterns(),
            waiting_patterns: default_waiting_patterns(),
            busy_patterns: default_busy_patterns(),
            error_patterns: default_error_patterns(),
        }
    }
}

fn default_idle_patterns() -> Vec<String> {
    vec![r"^\s*[>❯›]\s*$".into(), r"\$\s*$".into()]
}

fn default_waiting_patterns() -> Vec<String> {
    vec![
        r"(?i)\(y/n\)".into(),
        r"(?i)do you want to".into(),
        r"(?i)press enter".into(),
    ]
}

fn default_busy_patterns() -> Vec<String> {
    vec![
        r"(?i)esc to interrupt".into(),
        r"(?i)thinking".into(),
        r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]".into(),
    ]
}

fn default_error_patterns() -> Vec<String> {
    vec![r"(?i)\berror\b:".into(), r"(?i)rate limit".into()]
}

fn default_role() -> String {
    "agent".into()
}

/// One session the binary keeps alive and prompts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Unique session name.
    pub name: String,
    /// Agent role, exported to the session as `AGENT_ROLE`.
    #[serde(default = "default_role")]
    pub role: String,
    /// Starting directory; canonicalized during validation.
    pub working_dir: PathBuf,
    /// Minimum seconds between prompts. Unscheduled when absent.
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    /// Prompt text override.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl SessionConfig {
    /// Prompt schedule, if an interval is configured.
    #[must_use]
    pub fn schedule(&self) -> Option<PromptSchedule> {
        self.interval_seconds.map(|interval| PromptSchedule {
            interval_seconds: Some(interval),
            prompt: self.prompt.clone(),
        })
    }

    /// Provisioning request for this session.
    #[must_use]
    pub fn request(&self) -> SessionRequest {
        SessionRequest {
            name: self.name.clone(),
            role: self.role.clone(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Registry entry for this session under backend id `session_id`.
    #[must_use]
    pub fn to_session(&self, session_id: impl Into<String>) -> Session {
        Session {
            role: self.role.clone(),
            working_dir: Some(self.working_dir.clone()),
            schedule: self.schedule(),
            status: SessionStatus::Idle,
            ..Session::new(session_id, self.name.clone())
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Health monitor cadence.
    #[serde(default)]
    pub health: HealthSection,
    /// Interval scheduler cadence.
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Batch provisioning retry policy.
    #[serde(default)]
    pub provisioner: ProvisionerSection,
    /// tmux invocation.
    #[serde(default)]
    pub tmux: TmuxSection,
    /// Pane output classification patterns.
    #[serde(default)]
    pub detector: DetectorSection,
    /// Sessions to provision and schedule.
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Breaker settings for the breaker called `name`.
    #[must_use]
    pub fn breaker_config(&self, name: &str) -> BreakerConfig {
        BreakerConfig {
            name: name.to_owned(),
            failure_threshold: self.breaker.failure_threshold,
            recovery_timeout: Duration::from_millis(self.breaker.recovery_timeout_ms),
            success_threshold: self.breaker.success_threshold,
        }
    }

    /// Health monitor settings.
    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            session_interval: Duration::from_secs(self.health.session_interval_seconds),
            ping_interval: Duration::from_secs(self.health.ping_interval_seconds),
            stale_threshold: Duration::from_secs(self.health.stale_threshold_seconds),
            ping_failure_threshold: self.health.ping_failure_threshold,
        }
    }

    /// Scheduler settings.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            sample_lines: self.scheduler.sample_lines,
            drain_timeout: Duration::from_millis(self.scheduler.drain_timeout_ms),
            drain_poll: Duration::from_millis(self.scheduler.drain_poll_ms),
            default_prompt: self.scheduler.default_prompt.clone(),
        }
    }

    /// Provisioner settings.
    #[must_use]
    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            max_retries: self.provisioner.max_retries,
            base_delay: Duration::from_millis(self.provisioner.base_delay_ms),
        }
    }

    /// tmux invocation settings.
    #[must_use]
    pub fn tmux_config(&self) -> TmuxConfig {
        TmuxConfig {
            binary: self.tmux.binary.clone(),
            socket_name: self.tmux.socket_name.clone(),
            launch_command: self.tmux.launch_command.clone(),
        }
    }

    /// Compile the detector patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern is not a valid regex.
    pub fn classifier(&self) -> Result<PatternClassifier> {
        PatternClassifier::new(
            &self.detector.idle_patterns,
            &self.detector.waiting_patterns,
            &self.detector.busy_patterns,
            &self.detector.error_patterns,
        )
    }

    /// Configured session by name.
    #[must_use]
    pub fn session(&self, name: &str) -> Option<&SessionConfig> {
        self.sessions.iter().find(|session| session.name == name)
    }

    fn validate(&mut self) -> Result<()> {
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(AppError::Config(
                "breaker thresholds must be greater than zero".into(),
            ));
        }

        if self.health.session_interval_seconds == 0 || self.health.ping_interval_seconds == 0 {
            return Err(AppError::Config(
                "health intervals must be greater than zero".into(),
            ));
        }

        if self.health.ping_failure_threshold == 0 {
            return Err(AppError::Config(
                "ping_failure_threshold must be greater than zero".into(),
            ));
        }

        if self.scheduler.poll_interval_ms == 0 || self.scheduler.drain_poll_ms == 0 {
            return Err(AppError::Config(
                "scheduler poll intervals must be greater than zero".into(),
            ));
        }

        if self.scheduler.default_prompt.trim().is_empty() {
            return Err(AppError::Config("default_prompt must not be empty".into()));
        }

        self.classifier()?;

        let mut names = HashSet::new();
        for session in &mut self.sessions {
            if session.name.trim().is_empty() {
                return Err(AppError::Config("session name must not be empty".into()));
            }
            if !names.insert(session.name.clone()) {
                return Err(AppError::Config(format!(
                    "duplicate session name: {}",
                    session.name
                )));
            }
            session.working_dir = session.working_dir.canonicalize().map_err(|err| {
                AppError::Config(format!(
                    "session {} working_dir invalid: {err}",
                    session.name
                ))
            })?;
        }

        Ok(())
    }
}
