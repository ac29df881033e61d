//! Concurrent batch session creation with bounded retry.
//!
//! All requests in a batch are created at once, one channel call each; a
//! failure never cancels or delays its siblings. Failed requests are then
//! retried sequentially in rounds separated by exponential backoff
//! (`base_delay`, `2 × base_delay`, `4 × base_delay`, …). Partial failure is
//! returned as data in a [`BatchReport`], never as an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::sleep;
use tracing::{info, info_span, warn, Instrument};

use crate::channel::{SessionChannel, SessionSpec};
use crate::AppError;

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Retry rounds after the initial concurrent attempt.
    pub max_retries: u32,
    /// Delay before the first retry round; doubles every round.
    pub base_delay: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ProvisionerConfig {
    /// Delay before retry round `round` (1-based).
    #[must_use]
    pub fn backoff(&self, round: u32) -> Duration {
        let factor = 2_u32.saturating_pow(round.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// A session to create, before batch numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Session name.
    pub name: String,
    /// Agent role.
    pub role: String,
    /// Starting directory.
    pub working_dir: PathBuf,
}

/// A request that produced a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// The request.
    pub spec: SessionSpec,
    /// Identifier assigned by the backend.
    pub session_id: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// A request that has not produced a session.
#[derive(Debug)]
pub struct ProvisionFailure {
    /// The request.
    pub spec: SessionSpec,
    /// Error from the most recent attempt.
    pub error: AppError,
    /// Attempts made so far.
    pub attempts: u32,
}

/// Partition of a batch into created and failed requests.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Created sessions, ordered by sequence number.
    pub succeeded: Vec<Provisioned>,
    /// Requests still failing, ordered by sequence number.
    pub failed: Vec<ProvisionFailure>,
}

impl BatchReport {
    /// Whether every request succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total requests in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// One line naming every failed session, or `None` if nothing failed.
    #[must_use]
    pub fn failure_summary(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        let names: Vec<String> = self
            .failed
            .iter()
            .map(|failure| format!("{} ({})", failure.spec.name, failure.error))
            .collect();
        Some(format!(
            "{} of {} sessions failed to start: {}",
            self.failed.len(),
            self.total(),
            names.join(", ")
        ))
    }

    fn sort(&mut self) {
        self.succeeded.sort_by_key(|p| p.spec.sequence);
        self.failed.sort_by_key(|f| f.spec.sequence);
    }
}

/// Creates sessions in batches over a [`SessionChannel`].
#[derive(Clone)]
pub struct BatchProvisioner {
    channel: Arc<dyn SessionChannel>,
    config: ProvisionerConfig,
}

impl BatchProvisioner {
    /// Create a provisioner.
    #[must_use]
    pub fn new(channel: Arc<dyn SessionChannel>, config: ProvisionerConfig) -> Self {
        Self { channel, config }
    }

    /// Attempt every request once, concurrently.
    pub async fn create_all(&self, specs: Vec<SessionSpec>) -> BatchReport {
        let attempts = specs.into_iter().map(|spec| {
            let span = info_span!("create_session", name = %spec.name, sequence = spec.sequence);
            async move {
                let result = self.channel.create_session(&spec).await;
                (spec, result)
            }
            .instrument(span)
        });

        let mut report = BatchReport::default();
        for (spec, result) in join_all(attempts).await {
            match result {
                Ok(session_id) => {
                    info!(name = %spec.name, %session_id, "session created");
                    report.succeeded.push(Provisioned {
                        spec,
                        session_id,
                        attempts: 1,
                    });
                }
                Err(error) => {
                    warn!(name = %spec.name, %error, "session creation failed");
                    report.failed.push(ProvisionFailure {
                        spec,
                        error,
                        attempts: 1,
                    });
                }
            }
        }
        report.sort();
        report
    }

    /// Retry the failed part of `report` sequentially with backoff.
    pub async fn retry_failed(&self, report: BatchReport) -> BatchReport {
        let BatchReport {
            mut succeeded,
            failed,
        } = report;
        let mut pending = failed;

        for round in 1..=self.config.max_retries {
            if pending.is_empty() {
                break;
            }
            let delay = self.config.backoff(round);
            info!(round, pending = pending.len(), delay = ?delay, "retrying failed sessions");
            sleep(delay).await;

            let mut still_failing = Vec::with_capacity(pending.len());
            for mut failure in pending {
                failure.attempts += 1;
                match self.channel.create_session(&failure.spec).await {
                    Ok(session_id) => {
                        info!(name = %failure.spec.name, %session_id, attempts = failure.attempts, "session created on retry");
                        succeeded.push(Provisioned {
                            spec: failure.spec,
                            session_id,
                            attempts: failure.attempts,
                        });
                    }
                    Err(error) => {
                        warn!(name = %failure.spec.name, attempts = failure.attempts, %error, "session retry failed");
                        failure.error = error;
                        still_failing.push(failure);
                    }
                }
            }
            pending = still_failing;
        }

        let mut report = BatchReport {
            succeeded,
            failed: pending,
        };
        report.sort();
        report
    }

    /// Number `requests` from 1, create them concurrently, then retry
    /// failures. Remaining failures are logged as one warning.
    pub async fn provision(&self, requests: Vec<SessionRequest>) -> BatchReport {
        let specs: Vec<SessionSpec> = requests
            .into_iter()
            .zip(1_u32..)
            .map(|(request, sequence)| SessionSpec {
                name: request.name,
                role: request.role,
                working_dir: request.working_dir,
                sequence,
            })
            .collect();
        let total = specs.len();

        let initial = self.create_all(specs).await;
        let report = if initial.is_complete() {
            initial
        } else {
            self.retry_failed(initial).await
        };

        match report.failure_summary() {
            Some(summary) => warn!(total, "{summary}"),
            None => info!(total, "all sessions provisioned"),
        }
        report
    }
}
