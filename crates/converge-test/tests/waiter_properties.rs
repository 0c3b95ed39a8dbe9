//! Waiter behavior under scripted probe sequences
//!
//! All tests run on a paused tokio clock, so timeouts and poll intervals
//! are exact and the suite runs instantly.

use std::time::Duration;

use converge_common::{
    Attributes, ConvergenceWaiter, ObservedState, PollPolicy, ResourceKey, WaitOutcome, WaitSpec,
};
use converge_test::{
    statuses, verify_cancelled, verify_failed, verify_success, verify_timeout, ScriptedProber,
    Step,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn key() -> ResourceKey {
    ResourceKey::new("widget", "w1")
}

fn spec(pending: &[&str], target: &[&str], timeout: Duration, poll: Duration) -> WaitSpec {
    WaitSpec::builder(timeout)
        .pending(pending.iter().copied())
        .target(target.iter().copied())
        .poll_interval(poll)
        .min_poll_interval(Duration::from_millis(1))
        .build()
        .unwrap()
}

async fn run(prober: &ScriptedProber, spec: &WaitSpec) -> WaitOutcome {
    ConvergenceWaiter::default()
        .wait(&key(), prober, spec, &CancellationToken::new())
        .await
}

#[tokio::test(start_paused = true)]
async fn test_creating_then_active_after_three_probes() {
    let prober = ScriptedProber::new(
        key(),
        statuses(&[Some("CREATING"), Some("CREATING"), Some("ACTIVE")]),
    );
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    let state = verify_success(&outcome, "ACTIVE").unwrap();
    assert_eq!(state.key, key());
    assert!(state.exists);
    assert_eq!(prober.probes(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_eventual_target_returns_that_observation() {
    for pending_probes in 0..6 {
        let mut steps = vec![Step::status("PENDING"); pending_probes];
        steps.push(Step::status("READY"));
        let prober = ScriptedProber::new(key(), steps);
        let spec = spec(&["PENDING"], &["READY", "ALSO_READY"], Duration::from_secs(30), Duration::from_secs(2));

        let outcome = run(&prober, &spec).await;

        verify_success(&outcome, "READY").unwrap();
        assert_eq!(prober.probes() as usize, pending_probes + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_deletion_aware_absence_is_success() {
    let prober = ScriptedProber::new(key(), statuses(&[Some("DELETING"), None]));
    let spec = WaitSpec::builder(Duration::from_secs(60))
        .pending(["DELETING"])
        .target(["DELETED"])
        .deletion_aware()
        .poll_interval(Duration::from_secs(1))
        .build()
        .unwrap();

    let outcome = run(&prober, &spec).await;

    let state = verify_success(&outcome, "DELETED").unwrap();
    assert!(!state.exists);
    assert_eq!(prober.probes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_absence_without_deletion_awareness_fails() {
    let prober = ScriptedProber::new(key(), statuses(&[Some("UPDATING"), None]));
    let spec = spec(&["UPDATING"], &["VALID"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    verify_failed(&outcome, "unexpected_absence").unwrap();
    assert_eq!(outcome.last_observed().map(|s| s.status.as_str()), Some("UPDATING"));
}

#[tokio::test(start_paused = true)]
async fn test_pending_until_timeout() {
    let prober = ScriptedProber::new(key(), [Step::status("UPDATING")]);
    let spec = spec(&["UPDATING"], &["VALID"], Duration::from_millis(100), Duration::from_millis(50));

    let start = Instant::now();
    let outcome = run(&prober, &spec).await;

    let elapsed = verify_timeout(&outcome, Some("UPDATING")).unwrap();
    assert!(elapsed >= Duration::from_millis(100));
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    assert!(!outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_never_exceeded_by_a_full_interval() {
    // 250ms budget with 100ms polling: probes at 0, 100, 200, then the
    // last sleep is cut to the remaining 50ms.
    let prober = ScriptedProber::new(key(), [Step::status("UPDATING")]);
    let spec = spec(&["UPDATING"], &["VALID"], Duration::from_millis(250), Duration::from_millis(100));

    let start = Instant::now();
    let outcome = run(&prober, &spec).await;

    assert!(outcome.is_timeout());
    assert_eq!(prober.probes(), 3);
    assert_eq!(start.elapsed(), Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_status_fails_immediately() {
    for pending_probes in [0usize, 1, 4] {
        let mut steps = vec![Step::status("UPDATING"); pending_probes];
        steps.push(Step::status("INVALID"));
        steps.push(Step::status("VALID"));
        let prober = ScriptedProber::new(key(), steps);
        let spec = spec(&["UPDATING"], &["VALID"], Duration::from_secs(60), Duration::from_secs(1));

        let outcome = run(&prober, &spec).await;

        let error = verify_failed(&outcome, "unexpected_status").unwrap();
        assert!(error.requires_intervention());
        assert!(error.to_string().contains("INVALID"));
        assert_eq!(prober.probes() as usize, pending_probes + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_wins_over_next_target() {
    let cancel = CancellationToken::new();
    let prober = ScriptedProber::new(
        key(),
        statuses(&[Some("CREATING"), Some("CREATING"), Some("ACTIVE")]),
    )
    .cancel_after(2, cancel.clone());
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = ConvergenceWaiter::default()
        .wait(&key(), &prober, &spec, &cancel)
        .await;

    verify_cancelled(&outcome).unwrap();
    assert_eq!(prober.probes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_sleep_stops_probing() {
    let cancel = CancellationToken::new();
    let prober = ScriptedProber::new(key(), [Step::status("CREATING")]);
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(600), Duration::from_secs(30));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(45)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = ConvergenceWaiter::default()
        .wait(&key(), &prober, &spec, &cancel)
        .await;

    verify_cancelled(&outcome).unwrap();
    assert_eq!(prober.probes(), 2);
    assert_eq!(start.elapsed(), Duration::from_secs(45));
    assert_eq!(outcome.last_observed().map(|s| s.status.as_str()), Some("CREATING"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_slow_probe() {
    let cancel = CancellationToken::new();
    let prober = ScriptedProber::new(key(), [Step::status("ACTIVE")])
        .with_latency(Duration::from_secs(10));
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let outcome = ConvergenceWaiter::default()
        .wait(&key(), &prober, &spec, &cancel)
        .await;

    verify_cancelled(&outcome).unwrap();
    assert_eq!(prober.probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_probe_errors_count_as_pending() {
    let prober = ScriptedProber::new(
        key(),
        vec![Step::Transient, Step::status("CREATING"), Step::Transient, Step::status("ACTIVE")],
    );
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    verify_success(&outcome, "ACTIVE").unwrap();
    assert_eq!(prober.probes(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_probe_errors_bounded_by_timeout() {
    let prober = ScriptedProber::new(key(), [Step::Transient]);
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(5), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    verify_timeout(&outcome, None).unwrap();
    assert_eq!(prober.probes(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_transient_probe_errors_bounded_by_limit() {
    let prober = ScriptedProber::new(key(), [Step::Transient]);
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1))
        .with_transient_probe_limit(Some(2));

    let outcome = run(&prober, &spec).await;

    let error = verify_failed(&outcome, "transient_probe_error").unwrap();
    assert!(error.is_retryable());
    assert_eq!(prober.probes(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_probe_error_fails() {
    let prober = ScriptedProber::new(key(), vec![Step::status("CREATING"), Step::Fatal]);
    let spec = spec(&["CREATING"], &["ACTIVE"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    verify_failed(&outcome, "fatal_probe_error").unwrap();
    assert_eq!(outcome.last_observed().map(|s| s.status.as_str()), Some("CREATING"));
}

#[tokio::test(start_paused = true)]
async fn test_initial_delay_precedes_first_probe() {
    let prober = ScriptedProber::new(key(), [Step::status("ACTIVE")]);
    let spec = WaitSpec::builder(Duration::from_secs(60))
        .pending(["CREATING"])
        .target(["ACTIVE"])
        .initial_delay(Duration::from_secs(7))
        .build()
        .unwrap();

    let start = Instant::now();
    let outcome = run(&prober, &spec).await;

    verify_success(&outcome, "ACTIVE").unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_initial_delay_longer_than_timeout_times_out() {
    let prober = ScriptedProber::new(key(), [Step::status("ACTIVE")]);
    let spec = WaitSpec::builder(Duration::from_secs(1))
        .pending(["CREATING"])
        .target(["ACTIVE"])
        .initial_delay(Duration::from_secs(10))
        .build()
        .unwrap();

    let start = Instant::now();
    let outcome = run(&prober, &spec).await;

    let elapsed = verify_timeout(&outcome, None).unwrap();
    assert_eq!(elapsed, Duration::from_secs(1));
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(prober.probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_seeded_wait_reports_seed_until_first_observation() {
    let prober = ScriptedProber::new(key(), [Step::status("ACTIVE")]);
    let spec = WaitSpec::builder(Duration::from_secs(5))
        .pending(["CREATING"])
        .target(["ACTIVE"])
        .initial_delay(Duration::from_secs(30))
        .build()
        .unwrap();
    let seed = ObservedState::present(key(), "CREATING", Attributes::new());

    let outcome = ConvergenceWaiter::default()
        .wait_seeded(&key(), &prober, &spec, &CancellationToken::new(), Some(seed))
        .await;

    verify_timeout(&outcome, Some("CREATING")).unwrap();
    assert_eq!(prober.probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_policy_spacing() {
    let prober = ScriptedProber::new(
        key(),
        statuses(&[Some("CREATING"), Some("CREATING"), Some("CREATING"), Some("ACTIVE")]),
    );
    let spec = WaitSpec::builder(Duration::from_secs(60))
        .pending(["CREATING"])
        .target(["ACTIVE"])
        .poll_interval(Duration::from_secs(1))
        .policy(PollPolicy::Exponential {
            max_interval: Duration::from_secs(3),
        })
        .build()
        .unwrap();

    let start = Instant::now();
    let outcome = run(&prober, &spec).await;

    verify_success(&outcome, "ACTIVE").unwrap();
    // 1s + 2s + 3s (capped)
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_flapping_target_not_debounced() {
    let prober = ScriptedProber::new(
        key(),
        statuses(&[Some("UPDATING"), Some("VALID"), Some("UPDATING"), Some("VALID")]),
    );
    let spec = spec(&["UPDATING"], &["VALID"], Duration::from_secs(60), Duration::from_secs(1));

    let outcome = run(&prober, &spec).await;

    verify_success(&outcome, "VALID").unwrap();
    assert_eq!(prober.probes(), 2);
}

#[test]
fn test_outcome_classification_separates_timeout_from_fatal() {
    use converge_common::{ConvergeError, ErrorClass, ObservedState};

    let timeout = WaitOutcome::Timeout {
        last: Some(ObservedState::present(key(), "UPDATING", Default::default())),
        elapsed: Duration::from_secs(600),
    };
    let failed = WaitOutcome::Failed {
        error: ConvergeError::UnexpectedStatus {
            key: key().to_string(),
            status: "INVALID".into(),
            expected: "VALID".into(),
        },
        last: None,
    };

    assert_eq!(timeout.classification(), Some(ErrorClass::Transient));
    assert_eq!(failed.classification(), Some(ErrorClass::Fatal));

    let err = tokio_test::assert_err!(timeout.into_result(&key()));
    assert!(err.may_still_converge());
    assert!(!err.requires_intervention());
}
