//! Session orchestration modules.
//!
//! Covers liveness and connectivity monitoring, interval prompting of idle
//! sessions, and batch session provisioning.

pub mod health_monitor;
pub mod prompt_scheduler;
pub mod provisioner;

pub use health_monitor::{ChannelHealth, HealthConfig, HealthMonitor, HealthReport, SessionHealth};
pub use prompt_scheduler::{IntervalScheduler, RunNow, SchedulerConfig, SchedulerStatus};
pub use provisioner::{
    BatchProvisioner, BatchReport, ProvisionFailure, Provisioned, ProvisionerConfig,
    SessionRequest,
};
