//! `tmux`-backed session channel.
//!
//! Every session is a detached tmux session. Prompts are typed with
//! `send-keys -l` followed by `Enter`; the two commands for one prompt run
//! under a [`FifoLock`] so concurrent prompts never interleave keystrokes.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::process::Output;
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info};

use super::classifier::PatternClassifier;
use crate::channel::{SessionChannel, SessionSpec, StateDetector};
use crate::models::state::DetectedState;
use crate::sync::lock::FifoLock;
use crate::{AppError, Result};

const NO_SERVER: &str = "no server running";
const NO_SESSION: &str = "can't find session";

/// How to invoke tmux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxConfig {
    /// tmux executable.
    pub binary: String,
    /// Dedicated server socket (`tmux -L`), if any.
    pub socket_name: Option<String>,
    /// Command started inside each new session.
    pub launch_command: Option<String>,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_owned(),
            socket_name: None,
            launch_command: None,
        }
    }
}

/// [`SessionChannel`] and [`StateDetector`] over the tmux CLI.
#[derive(Debug)]
pub struct TmuxChannel {
    config: TmuxConfig,
    classifier: PatternClassifier,
    keys: FifoLock,
    /// Hash of the last pane capture per session, for [`TmuxChannel::output_changed`].
    fingerprints: Mutex<HashMap<String, u64>>,
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}

impl TmuxChannel {
    /// Create a channel.
    #[must_use]
    pub fn new(config: TmuxConfig, classifier: PatternClassifier) -> Self {
        Self {
            config,
            classifier,
            keys: FifoLock::new(),
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    /// Capture the pane tail of `session_id` and report whether it differs
    /// from the previous capture. The first capture of a session counts as
    /// a change.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the pane cannot be captured.
    pub async fn output_changed(&self, session_id: &str, sample_lines: usize) -> Result<bool> {
        let pane = self.capture(session_id, sample_lines).await?;
        let mut hasher = DefaultHasher::new();
        pane.hash(&mut hasher);
        let fingerprint = hasher.finish();

        let previous = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_owned(), fingerprint);
        Ok(previous != Some(fingerprint))
    }

    async fn capture(&self, session_id: &str, sample_lines: usize) -> Result<String> {
        let target = Self::target(session_id);
        let start = format!("-{sample_lines}");
        let output = self
            .tmux_checked(&["capture-pane", "-p", "-t", &target, "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn tmux(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.config.binary);
        if let Some(socket) = &self.config.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args).kill_on_drop(true);
        debug!(?args, "running tmux");
        cmd.output()
            .await
            .map_err(|err| AppError::Channel(format!("failed to run {}: {err}", self.config.binary)))
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.tmux(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(AppError::Channel(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr_of(&output)
            )))
        }
    }

    /// Target a session by exact name or id.
    fn target(session_id: &str) -> String {
        if session_id.starts_with('$') {
            session_id.to_owned()
        } else {
            format!("={session_id}")
        }
    }
}

impl SessionChannel for TmuxChannel {
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = Self::target(session_id);
            self.keys
                .run_exclusive(async {
                    self.tmux_checked(&["send-keys", "-t", &target, "-l", prompt])
                        .await?;
                    self.tmux_checked(&["send-keys", "-t", &target, "Enter"])
                        .await?;
                    Ok(())
                })
                .await
        })
    }

    fn check_session_exists<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let target = Self::target(session_id);
            let output = self.tmux(&["has-session", "-t", &target]).await?;
            if output.status.success() {
                return Ok(true);
            }
            let stderr = stderr_of(&output);
            if stderr.contains(NO_SESSION) || stderr.contains(NO_SERVER) {
                Ok(false)
            } else {
                Err(AppError::Channel(format!("tmux has-session failed: {stderr}")))
            }
        })
    }

    fn check_channel_health(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let output = self.tmux(&["list-sessions", "-F", "#{session_id}"]).await?;
            // A server with no sessions yet is reachable, just empty.
            Ok(output.status.success() || stderr_of(&output).contains(NO_SERVER))
        })
    }

    fn create_session<'a>(&'a self, spec: &'a SessionSpec) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let dir = spec.working_dir.to_string_lossy();
            let role_env = format!("AGENT_ROLE={}", spec.role);
            let mut args = vec![
                "new-session",
                "-d",
                "-P",
                "-F",
                "#{session_id}",
                "-s",
                spec.name.as_str(),
                "-c",
                dir.as_ref(),
                "-e",
                role_env.as_str(),
            ];
            if let Some(command) = &self.config.launch_command {
                args.push(command.as_str());
            }

            let output = self.tmux(&args).await?;
            if !output.status.success() {
                return Err(AppError::Provision(format!(
                    "tmux new-session for {} failed: {}",
                    spec.name,
                    stderr_of(&output)
                )));
            }
            let session_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            if session_id.is_empty() {
                return Err(AppError::Provision(format!(
                    "tmux new-session for {} returned no id",
                    spec.name
                )));
            }
            info!(name = %spec.name, %session_id, "tmux session created");
            Ok(session_id)
        })
    }
}

impl StateDetector for TmuxChannel {
    fn detect_state<'a>(
        &'a self,
        session_id: &'a str,
        sample_lines: usize,
    ) -> BoxFuture<'a, Result<DetectedState>> {
        Box::pin(async move {
            let pane = self.capture(session_id, sample_lines).await?;
            Ok(self.classifier.classify(&pane))
        })
    }
}
