#![forbid(unsafe_code)]

//! `agent-cadence`: keeps a fleet of tmux agent sessions alive and prompts
//! them on an interval while they sit idle.
//!
//! Bootstraps configuration, provisions configured sessions that do not
//! exist yet, then runs the health monitor and the interval scheduler until
//! a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use agent_cadence::backend::TmuxChannel;
use agent_cadence::channel::{GuardedChannel, SessionChannel, StateDetector};
use agent_cadence::config::{GlobalConfig, SessionConfig};
use agent_cadence::models::{SessionRegistry, SessionStatus};
use agent_cadence::orchestrator::{
    BatchProvisioner, HealthMonitor, HealthReport, IntervalScheduler,
};
use agent_cadence::resilience::{BreakerEvent, BreakerRegistry};
use agent_cadence::{AppError, Result};

const CHANNEL_BREAKER: &str = "tmux";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-cadence", about = "Interval prompting for tmux agent sessions", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Only manage configured sessions that already exist.
    #[arg(long)]
    skip_provision: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-cadence bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Io(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(sessions = config.sessions.len(), "configuration loaded");

    // ── Build the channel ───────────────────────────────
    let breakers = BreakerRegistry::new();
    let breaker = breakers.get_or_create(config.breaker_config(CHANNEL_BREAKER));
    breaker.on_event(log_breaker_event);

    let tmux = Arc::new(TmuxChannel::new(config.tmux_config(), config.classifier()?));
    let channel: Arc<dyn SessionChannel> = Arc::new(GuardedChannel::new(
        Arc::clone(&tmux) as Arc<dyn SessionChannel>,
        breaker,
    ));
    let detector: Arc<dyn StateDetector> = Arc::clone(&tmux) as Arc<dyn StateDetector>;

    // ── Provision and register sessions ─────────────────
    let registry = SessionRegistry::new();
    register_sessions(&config, &channel, &registry, args.skip_provision).await;

    // ── Start monitoring and scheduling ─────────────────
    let health_config = config.health_config();
    let scheduler_config = config.scheduler_config();
    let sweep_every = health_config.session_interval;
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&channel),
        registry.clone(),
        health_config,
    ));
    health.subscribe(log_health_report);
    health.start();

    let watch = CancellationToken::new();
    let watcher = tokio::spawn(
        watch_output(
            tmux,
            registry.clone(),
            Arc::clone(&health),
            sweep_every,
            scheduler_config.sample_lines,
            watch.clone(),
        )
        .instrument(info_span!("output_watch")),
    );

    let scheduler = IntervalScheduler::new(channel, detector, scheduler_config);
    let scheduled = scheduler.start_all(&registry).await;
    info!(
        registered = registry.len().await,
        scheduled, "agent-cadence ready"
    );

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    scheduler.stop_all().await;
    watch.cancel();
    let _ = watcher.await;
    health.stop().await;

    match serde_json::to_string(&breakers.snapshots()) {
        Ok(json) => info!(breakers = %json, "final breaker state"),
        Err(err) => error!(%err, "failed to serialize breaker state"),
    }
    info!("agent-cadence shut down");

    Ok(())
}

/// Register every configured session, creating missing ones first unless
/// `skip_provision` is set. Sessions are keyed by their tmux name.
async fn register_sessions(
    config: &GlobalConfig,
    channel: &Arc<dyn SessionChannel>,
    registry: &SessionRegistry,
    skip_provision: bool,
) {
    let mut missing: Vec<&SessionConfig> = Vec::new();
    for session in &config.sessions {
        match channel.check_session_exists(&session.name).await {
            Ok(true) => {
                registry.insert(session.to_session(&session.name)).await;
                debug!(name = %session.name, "existing session registered");
            }
            Ok(false) => missing.push(session),
            Err(err) => {
                warn!(name = %session.name, %err, "could not check session; leaving unregistered");
            }
        }
    }

    if missing.is_empty() {
        return;
    }
    if skip_provision {
        info!(count = missing.len(), "provisioning skipped for missing sessions");
        return;
    }

    for session in &missing {
        let mut launching = session.to_session(&session.name);
        launching.status = SessionStatus::Launching;
        registry.insert(launching).await;
    }

    let provisioner = BatchProvisioner::new(Arc::clone(channel), config.provisioner_config());
    let requests = missing.iter().map(|session| session.request()).collect();
    let report = provisioner
        .provision(requests)
        .instrument(info_span!("provision", count = missing.len()))
        .await;

    for created in &report.succeeded {
        registry
            .set_status(&created.spec.name, SessionStatus::Idle)
            .await;
        debug!(name = %created.spec.name, session_id = %created.session_id, "provisioned session registered");
    }
    for failure in &report.failed {
        registry.remove(&failure.spec.name).await;
    }
}

/// Feed pane output changes into the health monitor's staleness tracking.
async fn watch_output(
    tmux: Arc<TmuxChannel>,
    registry: SessionRegistry,
    health: Arc<HealthMonitor>,
    every: Duration,
    sample_lines: usize,
    cancel: CancellationToken,
) {
    loop {
        for session in registry.list().await {
            if session.status == SessionStatus::Launching {
                continue;
            }
            match tmux.output_changed(&session.id, sample_lines).await {
                Ok(true) => health.record_activity(&session.id).await,
                Ok(false) => {}
                Err(err) => debug!(session_id = %session.id, %err, "pane capture failed"),
            }
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(every) => {}
        }
    }
}

fn log_breaker_event(event: &BreakerEvent) {
    match event {
        BreakerEvent::StateChange { name, from, to } => {
            warn!(breaker = %name, %from, %to, "circuit state changed");
        }
        BreakerEvent::Failure {
            name,
            error,
            failure_count,
        } => debug!(breaker = %name, %error, failure_count, "channel call failed"),
        BreakerEvent::Success { .. } => {}
        BreakerEvent::Rejected { name, state } => {
            debug!(breaker = %name, %state, "channel call rejected");
        }
    }
}

fn log_health_report(report: &HealthReport) {
    if !report.channel.connected {
        warn!(
            failures = report.channel.consecutive_failures,
            error = report.channel.last_error.as_deref().unwrap_or_default(),
            "tmux server unreachable"
        );
    }
    for session in report.sessions.iter().filter(|session| session.is_stale) {
        warn!(
            session_id = %session.session_id,
            silent_ms = session.time_since_activity_ms,
            "session has gone quiet"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
