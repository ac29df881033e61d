//! Session model and prompt schedule validation.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Registry-level status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is being created; health checks skip it.
    Launching,
    /// Session exists and is ready for work.
    Idle,
    /// Session is working.
    Busy,
    /// Session is waiting for input.
    Waiting,
    /// Session is missing or unhealthy.
    Error,
    /// Session was stopped on purpose.
    Stopped,
}

/// Result of the most recent existence check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Not checked yet, or the last check could not reach the channel.
    #[default]
    Unknown,
    /// The backend reported the session present.
    Alive,
    /// The backend reported the session absent.
    Missing,
}

/// Interval prompting settings attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct PromptSchedule {
    /// Minimum seconds between prompts; `0` prompts continuously.
    pub interval_seconds: Option<i64>,
    /// Prompt text; falls back to the configured default when absent.
    pub prompt: Option<String>,
}

impl PromptSchedule {
    /// Build a schedule with an explicit interval and prompt.
    #[must_use]
    pub fn new(interval_seconds: i64, prompt: impl Into<String>) -> Self {
        Self {
            interval_seconds: Some(interval_seconds),
            prompt: Some(prompt.into()),
        }
    }

    /// Resolve the minimum interval and prompt text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the interval is missing or negative,
    /// or if neither the schedule nor `default_prompt` provides text.
    pub fn resolve(&self, default_prompt: &str) -> Result<(Duration, String)> {
        let seconds = self
            .interval_seconds
            .ok_or_else(|| AppError::Config("prompt interval is not set".into()))?;
        let seconds = u64::try_from(seconds).map_err(|_| {
            AppError::Config(format!("prompt interval must not be negative: {seconds}"))
        })?;

        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(default_prompt.trim());
        if prompt.is_empty() {
            return Err(AppError::Config("prompt text is empty".into()));
        }

        Ok((Duration::from_secs(seconds), prompt.to_owned()))
    }
}

/// A long-lived agent session known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Stable backend identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Role the agent plays in the workspace.
    pub role: String,
    /// Working directory the session was launched in.
    pub working_dir: Option<PathBuf>,
    /// Current registry status.
    pub status: SessionStatus,
    /// Result of the last existence check.
    pub liveness: Liveness,
    /// Last time output was observed.
    pub last_activity: Option<DateTime<Utc>>,
    /// Interval prompting settings, if the session is scheduled.
    pub schedule: Option<PromptSchedule>,
}

impl Session {
    /// Construct an idle, unscheduled session.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            working_dir: None,
            status: SessionStatus::Idle,
            liveness: Liveness::Unknown,
            last_activity: None,
            schedule: None,
        }
    }

    /// Attach a prompt schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: PromptSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Whether health checks should skip this session.
    #[must_use]
    pub fn is_launching(&self) -> bool {
        self.status == SessionStatus::Launching
    }
}
