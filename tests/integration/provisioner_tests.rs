use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_cadence::channel::{SessionChannel, SessionSpec};
use agent_cadence::orchestrator::{BatchProvisioner, ProvisionerConfig, SessionRequest};
use agent_cadence::AppError;
use tokio::time::Instant;

use super::test_helpers::FakeChannel;

fn provisioner(fake: &Arc<FakeChannel>) -> BatchProvisioner {
    BatchProvisioner::new(
        Arc::clone(fake) as Arc<dyn SessionChannel>,
        ProvisionerConfig {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        },
    )
}

fn requests(names: &[&str]) -> Vec<SessionRequest> {
    names
        .iter()
        .map(|name| SessionRequest {
            name: (*name).to_owned(),
            role: "agent".into(),
            working_dir: PathBuf::from("/tmp"),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_is_isolated_and_retried() {
    let fake = FakeChannel::new();
    fake.fail_creates("beta", u32::MAX);

    let report = provisioner(&fake)
        .provision(requests(&["alpha", "beta", "gamma", "delta"]))
        .await;

    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.is_complete());

    let failure = &report.failed[0];
    assert_eq!(failure.spec.name, "beta");
    assert_eq!(failure.spec.sequence, 2);
    assert_eq!(failure.attempts, 3, "one initial attempt plus two retries");
    assert!(matches!(failure.error, AppError::Provision(_)));
    assert_eq!(fake.create_attempts("beta"), 3);
    for name in ["alpha", "gamma", "delta"] {
        assert_eq!(fake.create_attempts(name), 1);
    }

    let sequences: Vec<u32> = report.succeeded.iter().map(|p| p.spec.sequence).collect();
    assert_eq!(sequences, vec![1, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn initial_attempts_run_concurrently() {
    let fake = FakeChannel::new();
    fake.set_create_delay(Duration::from_secs(5));
    fake.fail_creates("slow-fail", 1);

    let begin = Instant::now();
    let report = provisioner(&fake)
        .create_all(vec![
            SessionSpec {
                name: "a".into(),
                role: "agent".into(),
                working_dir: PathBuf::from("/tmp"),
                sequence: 1,
            },
            SessionSpec {
                name: "slow-fail".into(),
                role: "agent".into(),
                working_dir: PathBuf::from("/tmp"),
                sequence: 2,
            },
            SessionSpec {
                name: "c".into(),
                role: "agent".into(),
                working_dir: PathBuf::from("/tmp"),
                sequence: 3,
            },
        ])
        .await;

    assert!(begin.elapsed() < Duration::from_secs(6), "attempts overlap");
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].attempts, 1);

    let times = fake.create_times();
    assert!(times.iter().all(|(_, at)| *at == times[0].1));
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially() {
    let fake = FakeChannel::new();
    fake.fail_creates("flaky", u32::MAX);

    let begin = Instant::now();
    let report = provisioner(&fake).provision(requests(&["flaky"])).await;
    assert_eq!(report.failed[0].attempts, 3);

    let offsets: Vec<Duration> = fake
        .create_times()
        .into_iter()
        .map(|(_, at)| at.duration_since(begin))
        .collect();
    assert_eq!(
        offsets,
        vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(3)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let fake = FakeChannel::new();
    fake.fail_creates("b", 1);

    let report = provisioner(&fake).provision(requests(&["a", "b"])).await;

    assert!(report.is_complete());
    assert!(report.failure_summary().is_none());
    let b = report
        .succeeded
        .iter()
        .find(|p| p.spec.name == "b")
        .unwrap();
    assert_eq!(b.attempts, 2);
    assert!(b.session_id.starts_with('$'));
}

#[tokio::test(start_paused = true)]
async fn summary_names_every_failed_session() {
    let fake = FakeChannel::new();
    fake.fail_creates("x", u32::MAX);
    fake.fail_creates("y", u32::MAX);

    let report = provisioner(&fake)
        .provision(requests(&["x", "ok", "y"]))
        .await;
    let summary = report.failure_summary().unwrap();

    assert!(summary.starts_with("2 of 3 sessions failed to start"));
    assert!(summary.contains("x (provision: x could not start)"));
    assert!(summary.contains("y ("));
    assert_eq!(report.total(), 3);
}

#[tokio::test]
async fn no_retries_when_disabled() {
    let fake = FakeChannel::new();
    fake.fail_creates("a", u32::MAX);
    let provisioner = BatchProvisioner::new(
        Arc::clone(&fake) as Arc<dyn SessionChannel>,
        ProvisionerConfig {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
        },
    );

    let report = provisioner.provision(requests(&["a"])).await;
    assert_eq!(report.failed[0].attempts, 1);
    assert_eq!(fake.create_attempts("a"), 1);
}

#[tokio::test]
async fn empty_batch_is_complete() {
    let fake = FakeChannel::new();
    let report = provisioner(&fake).provision(Vec::new()).await;
    assert!(report.is_complete());
    assert_eq!(report.total(), 0);
}

#[test]
fn backoff_doubles_per_round() {
    let config = ProvisionerConfig::default();
    assert_eq!(config.backoff(1), Duration::from_secs(1));
    assert_eq!(config.backoff(2), Duration::from_secs(2));
    assert_eq!(config.backoff(3), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn retry_failed_keeps_earlier_successes() {
    let fake = FakeChannel::new();
    fake.fail_creates("b", 1);
    let provisioner = provisioner(&fake);

    let first = provisioner
        .create_all(vec![
            SessionSpec {
                name: "a".into(),
                role: "agent".into(),
                working_dir: PathBuf::from("/tmp"),
                sequence: 1,
            },
            SessionSpec {
                name: "b".into(),
                role: "agent".into(),
                working_dir: PathBuf::from("/tmp"),
                sequence: 2,
            },
        ])
        .await;
    assert_eq!(first.failed.len(), 1);

    let retried = provisioner.retry_failed(first).await;
    assert!(retried.is_complete());
    let names: Vec<&str> = retried
        .succeeded
        .iter()
        .map(|p| p.spec.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(fake.create_attempts("a"), 1);
    assert_eq!(fake.create_attempts("b"), 2);
}
