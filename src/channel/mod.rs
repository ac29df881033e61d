//! Remote session channel abstraction.
//!
//! The [`SessionChannel`] trait is the only route to the session backend:
//! prompt delivery, existence checks, channel pings and session creation
//! are all fallible async calls. [`StateDetector`] classifies what a
//! session is currently doing. [`GuardedChannel`] puts a shared circuit
//! breaker in front of any channel implementation.

pub mod guarded;

use std::path::PathBuf;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::models::state::DetectedState;
use crate::Result;

pub use guarded::GuardedChannel;

/// Parameters for creating one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionSpec {
    /// Session name, unique within the workspace.
    pub name: String,
    /// Role the agent plays.
    pub role: String,
    /// Directory the session starts in.
    pub working_dir: PathBuf,
    /// 1-based position within its provisioning batch.
    pub sequence: u32,
}

/// Fallible async calls into the session backend.
pub trait SessionChannel: Send + Sync {
    /// Deliver `prompt` to the agent in `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if delivery fails.
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Whether `session_id` exists in the backend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the backend cannot be asked. An
    /// absent session is `Ok(false)`, not an error.
    fn check_session_exists<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Probe the channel itself.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the probe cannot be performed.
    fn check_channel_health(&self) -> BoxFuture<'_, Result<bool>>;

    /// Create a session and return its backend identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Provision` or `AppError::Channel` on failure.
    fn create_session<'a>(&'a self, spec: &'a SessionSpec) -> BoxFuture<'a, Result<String>>;
}

/// Classifies the current activity of a session from a sample of its output.
pub trait StateDetector: Send + Sync {
    /// Inspect the last `sample_lines` lines of output from `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the output cannot be sampled.
    fn detect_state<'a>(
        &'a self,
        session_id: &'a str,
        sample_lines: usize,
    ) -> BoxFuture<'a, Result<DetectedState>>;
}
