use std::sync::Arc;
use std::time::Duration;

use agent_cadence::channel::{SessionChannel, StateDetector};
use agent_cadence::models::{AgentState, DetectedState, PromptSchedule, Session, SessionRegistry};
use agent_cadence::orchestrator::{IntervalScheduler, RunNow, SchedulerConfig};
use agent_cadence::AppError;
use tokio::time::{sleep, Instant};

use super::test_helpers::{FakeChannel, FakeDetector};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(100),
        sample_lines: 40,
        drain_timeout: Duration::from_secs(5),
        drain_poll: Duration::from_millis(100),
        default_prompt: "continue".into(),
    }
}

fn scheduler(fake: &Arc<FakeChannel>, detector: &Arc<FakeDetector>) -> IntervalScheduler {
    scheduler_with(fake, detector, config())
}

fn scheduler_with(
    fake: &Arc<FakeChannel>,
    detector: &Arc<FakeDetector>,
    config: SchedulerConfig,
) -> IntervalScheduler {
    IntervalScheduler::new(
        Arc::clone(fake) as Arc<dyn SessionChannel>,
        Arc::clone(detector) as Arc<dyn StateDetector>,
        config,
    )
}

fn scheduled(id: &str, interval_seconds: i64, prompt: &str) -> Session {
    Session::new(id, id).with_schedule(PromptSchedule::new(interval_seconds, prompt))
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_prompted_no_faster_than_min_interval() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    assert!(scheduler.start(&scheduled("a", 1, "go")));
    sleep(Duration::from_millis(5_050)).await;
    scheduler.stop_all().await;

    let sent = fake.sent();
    assert!(sent.len() >= 4, "expected repeated prompts, got {}", sent.len());
    for pair in sent.windows(2) {
        let gap = pair[1].started.duration_since(pair[0].finished);
        assert!(gap >= Duration::from_secs(1), "prompts only {gap:?} apart");
    }
    assert!(sent.iter().all(|p| p.session_id == "a" && p.prompt == "go"));
}

#[tokio::test(start_paused = true)]
async fn zero_interval_prompts_every_poll_without_overlap() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "next"));
    sleep(Duration::from_millis(1_050)).await;
    scheduler.stop_all().await;

    assert!(fake.sent_count() >= 10, "got {}", fake.sent_count());
    assert_eq!(fake.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_send_is_never_overlapped() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(3));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "next"));
    sleep(Duration::from_millis(1_000)).await;
    assert!(scheduler.status("a").unwrap().active);

    sleep(Duration::from_secs(9)).await;
    scheduler.stop_all().await;

    assert_eq!(fake.max_in_flight(), 1);
    assert!(fake.sent_count() >= 2);
    for pair in fake.sent().windows(2) {
        assert!(pair[1].started >= pair[0].finished);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_send_does_not_advance_last_prompt() {
    let fake = FakeChannel::new();
    fake.fail_next_sends(1);
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 10, "go"));
    sleep(Duration::from_millis(50)).await;

    let status = scheduler.status("a").unwrap();
    assert_eq!(status.failed_sends, 1);
    assert!(status.last_prompt_at.is_none());
    assert_eq!(status.next_eligible_in_ms, 0);

    sleep(Duration::from_millis(100)).await;
    let status = scheduler.status("a").unwrap();
    assert_eq!(status.prompts_sent, 1, "retried on the next poll");
    assert!(status.last_prompt_at.is_some());
    assert_eq!(fake.send_attempts(), 2);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(fake.send_attempts(), 2, "interval gate holds after success");
    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn busy_session_waits_and_transition_is_counted() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    detector.set("a", AgentState::Busy);
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "go"));
    sleep(Duration::from_millis(550)).await;
    assert_eq!(fake.sent_count(), 0);
    let status = scheduler.status("a").unwrap();
    assert_eq!(status.classification, AgentState::Busy);
    assert!(!status.is_idle);

    detector.set("a", AgentState::Idle);
    sleep(Duration::from_millis(100)).await;
    let status = scheduler.status("a").unwrap();
    assert_eq!(status.idle_transitions, 1);
    assert_eq!(status.previous_classification, Some(AgentState::Busy));
    assert_eq!(fake.sent_count(), 1);

    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn waiting_for_input_counts_as_idle() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    detector.set_detected(
        "a",
        DetectedState {
            status: AgentState::Unknown,
            is_waiting: true,
            has_error: false,
        },
    );
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 60, "yes"));
    sleep(Duration::from_millis(50)).await;
    scheduler.stop_all().await;

    assert_eq!(fake.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn error_screen_is_not_prompted() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    detector.set_detected(
        "a",
        DetectedState {
            status: AgentState::Idle,
            is_waiting: false,
            has_error: true,
        },
    );
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "go"));
    sleep(Duration::from_millis(350)).await;
    scheduler.stop_all().await;

    assert_eq!(fake.sent_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn detection_failure_skips_without_stopping_the_loop() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    detector.set_failing(true);
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "go"));
    sleep(Duration::from_millis(350)).await;
    assert_eq!(fake.sent_count(), 0);
    assert!(detector.calls() >= 3);
    assert!(scheduler.is_polling());

    detector.set_failing(false);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fake.sent_count(), 1);
    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_schedules_are_not_registered() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    assert!(!scheduler.start(&Session::new("plain", "plain")));
    assert!(!scheduler.start(&scheduled("negative", -1, "go")));
    assert!(!scheduler.start(&Session::new("blank", "blank").with_schedule(PromptSchedule {
        interval_seconds: None,
        prompt: Some("go".into()),
    })));

    assert!(!scheduler.is_managed("plain"));
    assert!(!scheduler.is_managed("negative"));
    assert!(scheduler.all_status().is_empty());
    assert!(!scheduler.is_polling());
}

#[tokio::test(start_paused = true)]
async fn poll_loop_follows_registrations() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 60, "go"));
    scheduler.start(&scheduled("b", 60, "go"));
    assert!(scheduler.is_polling());

    assert!(scheduler.stop("a").await);
    assert!(scheduler.is_polling(), "loop runs while sessions remain");
    assert!(!scheduler.stop("a").await, "already unregistered");

    assert!(scheduler.stop("b").await);
    assert!(!scheduler.is_polling());

    let detections = detector.calls();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(detector.calls(), detections, "no polling after the last stop");
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_prompt() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(2));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "go"));
    sleep(Duration::from_millis(50)).await;
    assert!(scheduler.status("a").unwrap().active);

    let begin = Instant::now();
    assert!(scheduler.stop("a").await);
    assert!(begin.elapsed() >= Duration::from_millis(1_900));
    assert_eq!(fake.sent_count(), 1, "in-flight prompt completed");
    assert!(!scheduler.is_managed("a"));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(fake.send_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_gives_up_after_drain_timeout() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(60));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "go"));
    sleep(Duration::from_millis(50)).await;

    let begin = Instant::now();
    assert!(scheduler.stop("a").await);
    let waited = begin.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    assert!(!scheduler.is_managed("a"));
}

#[tokio::test(start_paused = true)]
async fn restart_after_drain_timeout_does_not_overlap_sends() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(20));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);
    let session = scheduled("a", 0, "go");

    scheduler.start(&session);
    sleep(Duration::from_millis(50)).await;
    assert!(scheduler.restart(&session).await);
    assert!(scheduler.status("a").unwrap().active, "old send still running");

    sleep(Duration::from_millis(500)).await;
    assert_eq!(fake.max_in_flight(), 1);
    assert_eq!(fake.send_attempts(), 1);
    assert_eq!(
        scheduler.run_now(&session).await.unwrap(),
        RunNow::AlreadyActive
    );

    sleep(Duration::from_secs(20)).await;
    assert_eq!(fake.max_in_flight(), 1);
    assert!(fake.send_attempts() >= 2, "prompting resumes once the old send ends");
    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn unregistered_send_still_blocks_run_now() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(60));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);
    let session = scheduled("a", 0, "go");

    scheduler.start(&session);
    sleep(Duration::from_millis(50)).await;
    scheduler.stop("a").await;
    assert!(!scheduler.is_managed("a"));

    assert_eq!(
        scheduler.run_now(&session).await.unwrap(),
        RunNow::AlreadyActive
    );
    assert_eq!(fake.send_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_now_bypasses_interval_but_not_active_send() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(2));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);
    let session = scheduled("a", 3_600, "go");

    scheduler.start(&session);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        scheduler.run_now(&session).await.unwrap(),
        RunNow::AlreadyActive
    );

    sleep(Duration::from_secs(3)).await;
    assert_eq!(fake.sent_count(), 1);
    assert_eq!(scheduler.run_now(&session).await.unwrap(), RunNow::Sent);
    assert_eq!(fake.sent_count(), 2);
    assert_eq!(scheduler.status("a").unwrap().prompts_sent, 2);

    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn run_now_propagates_send_errors() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    detector.set("a", AgentState::Busy);
    let scheduler = scheduler(&fake, &detector);
    let session = scheduled("a", 60, "go");
    scheduler.start(&session);

    fake.set_down(true);
    let err = scheduler.run_now(&session).await.unwrap_err();
    assert!(matches!(err, AppError::Channel(_)));

    let status = scheduler.status("a").unwrap();
    assert_eq!(status.failed_sends, 1);
    assert!(!status.active, "active flag is cleared after failure");
    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn run_now_on_unmanaged_session_uses_default_prompt() {
    let fake = FakeChannel::new();
    fake.set_send_delay(Duration::from_secs(1));
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);
    let session = Session::new("loose", "loose");

    let (first, second) = tokio::join!(scheduler.run_now(&session), scheduler.run_now(&session));
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|outcome| *outcome == RunNow::Sent);
    assert_eq!(outcomes, vec![RunNow::AlreadyActive, RunNow::Sent]);

    let sent = fake.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].prompt, "continue");
    assert!(!scheduler.is_managed("loose"));
    assert!(!scheduler.is_polling());
}

#[tokio::test]
async fn run_now_without_any_prompt_text_is_config_error() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler_with(
        &fake,
        &detector,
        SchedulerConfig {
            default_prompt: String::new(),
            ..config()
        },
    );

    let err = scheduler
        .run_now(&Session::new("loose", "loose"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
    assert_eq!(fake.send_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_and_update_apply_new_prompt() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    let scheduler = scheduler(&fake, &detector);

    scheduler.start(&scheduled("a", 0, "old"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.sent().last().unwrap().prompt, "old");

    assert!(scheduler.start(&scheduled("a", 0, "updated")));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fake.sent().last().unwrap().prompt, "updated");
    assert!(
        scheduler.status("a").unwrap().prompts_sent >= 2,
        "updating in place keeps counters"
    );

    assert!(scheduler.restart(&scheduled("a", 0, "restarted")).await);
    sleep(Duration::from_millis(50)).await;
    let status = scheduler.status("a").unwrap();
    assert_eq!(status.prompt, "restarted");
    assert_eq!(status.prompts_sent, 1, "restart begins with fresh state");

    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn start_all_and_stop_all() {
    let fake = FakeChannel::new();
    let detector = FakeDetector::new();
    for id in ["a", "b", "c"] {
        detector.set(id, AgentState::Busy);
    }
    let scheduler = scheduler(&fake, &detector);

    let registry = SessionRegistry::new();
    registry.insert(scheduled("c", 30, "go")).await;
    registry.insert(scheduled("a", 30, "go")).await;
    registry.insert(Session::new("b", "b")).await;
    registry.insert(scheduled("bad", -3, "go")).await;

    assert_eq!(scheduler.start_all(&registry).await, 2);
    let ids: Vec<String> = scheduler
        .all_status()
        .into_iter()
        .map(|status| status.session_id)
        .collect();
    assert_eq!(ids, vec!["a", "c"]);

    scheduler.stop_all().await;
    assert!(scheduler.all_status().is_empty());
    assert!(!scheduler.is_polling());
}
