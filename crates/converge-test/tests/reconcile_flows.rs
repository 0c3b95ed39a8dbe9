//! Create, update and delete flows through the reconciler
//!
//! Uses the scripted `widget` kind: CREATING/UPDATING settle to VALID,
//! deletion drains to DISABLED first.

use std::sync::Arc;
use std::time::Duration;

use converge_common::{
    attrs, BackoffStrategy, ConvergeError, ErrorClass, MutationAck, MutationOp, MutationRequest, ObservedState,
    Phase, RetryPolicy, Severity,
};
use converge_test::{
    statuses, verify_failed, verify_phases, verify_success, verify_timeout, widget,
    widget_reconciler, MutateStep, ScriptedClient, Step,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BUDGET: Duration = Duration::from_secs(600);

fn ops(client: &ScriptedClient) -> Vec<MutationOp> {
    client.requests().into_iter().map(|r| r.op).collect()
}

#[tokio::test(start_paused = true)]
async fn test_create_rekeys_on_assigned_id() {
    let client = Arc::new(
        ScriptedClient::new(statuses(&[Some("CREATING"), Some("VALID")]))
            .with_mutations([MutateStep::Ack(
                MutationAck::with_id("arn:widget/w1").status("CREATING"),
            )]),
    );
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());

    let result = reconciler
        .create(
            MutationRequest::create(widget("w1"), attrs! { "priority" => 10i64 }),
            &CancellationToken::new(),
        )
        .await;

    verify_phases(
        &result,
        &[Phase::Requested, Phase::Dispatched, Phase::Waiting, Phase::Succeeded],
    )
    .unwrap();
    assert_eq!(result.key, widget("arn:widget/w1"));
    let state = verify_success(&result.outcome, "VALID").unwrap();
    assert_eq!(state.key.id, "arn:widget/w1");
    assert_eq!(client.probes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_create_retries_throttled_mutation() {
    let client = Arc::new(
        ScriptedClient::new([Step::status("VALID")])
            .with_mutations([MutateStep::Transient, MutateStep::Transient]),
    );
    let retry = RetryPolicy::new(3, BackoffStrategy::Fixed, Duration::from_secs(2));
    let reconciler = widget_reconciler(client.clone(), BUDGET, retry);

    let start = Instant::now();
    let result = reconciler
        .create(MutationRequest::create(widget("w1"), attrs! {}), &CancellationToken::new())
        .await;

    assert!(result.is_success());
    assert_eq!(client.requests().len(), 3);
    assert_eq!(result.mutations, 1);
    assert_eq!(start.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_create_gives_up_after_attempt_ceiling() {
    let client = Arc::new(
        ScriptedClient::new([Step::status("VALID")]).with_mutations(vec![MutateStep::Transient; 5]),
    );
    let retry = RetryPolicy::new(2, BackoffStrategy::Fixed, Duration::from_secs(1));
    let reconciler = widget_reconciler(client.clone(), BUDGET, retry);

    let result = reconciler
        .create(MutationRequest::create(widget("w1"), attrs! {}), &CancellationToken::new())
        .await;

    verify_failed(&result.outcome, "transient_mutation_error").unwrap();
    assert_eq!(result.phase(), Phase::Failed);
    assert_eq!(result.classification(), Some(ErrorClass::Transient));
    assert_eq!(client.requests().len(), 2);
    assert_eq!(client.probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_reports_warning() {
    let client = Arc::new(ScriptedClient::new([Step::status("CREATING")]));
    let reconciler =
        widget_reconciler(client.clone(), Duration::from_secs(30), RetryPolicy::no_retry());

    let result = reconciler
        .create(MutationRequest::create(widget("w1"), attrs! {}), &CancellationToken::new())
        .await;

    verify_timeout(&result.outcome, Some("CREATING")).unwrap();
    assert_eq!(result.phase(), Phase::TimedOut);
    assert!(!result.has_errors());
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].severity, Severity::Warning);
    assert!(result.diagnostics[0].detail.contains("may still converge"));

    let err = result.into_result().unwrap_err();
    assert!(err.may_still_converge());
}

#[tokio::test(start_paused = true)]
async fn test_update_applies_groups_in_declared_order() {
    let client = Arc::new(
        ScriptedClient::new(statuses(&[Some("UPDATING"), Some("VALID"), Some("UPDATING"), Some("VALID")])),
    );
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());
    let observed = ObservedState::present(
        widget("w1"),
        "VALID",
        attrs! { "priority" => 1i64, "state" => "ENABLED" },
    );

    let result = reconciler
        .update(
            &widget("w1"),
            &attrs! { "state" => "DISABLED", "priority" => 5i64 },
            &observed,
            &CancellationToken::new(),
        )
        .await;

    verify_phases(
        &result,
        &[
            Phase::Requested,
            Phase::Dispatched,
            Phase::Waiting,
            Phase::Dispatched,
            Phase::Waiting,
            Phase::Succeeded,
        ],
    )
    .unwrap();
    let requests = client.requests();
    assert_eq!(
        requests.iter().map(|r| r.op.clone()).collect::<Vec<_>>(),
        vec![
            MutationOp::Update { group: "settings".into() },
            MutationOp::Update { group: "state".into() },
        ]
    );
    assert_eq!(requests[0].attrs, attrs! { "priority" => 5i64 });
    assert_eq!(requests[1].attrs, attrs! { "state" => "DISABLED" });
}

#[tokio::test(start_paused = true)]
async fn test_update_no_change_detects_drift() {
    let client = Arc::new(ScriptedClient::new([Step::status("INVALID")]));
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());
    let observed = ObservedState::present(widget("w1"), "VALID", attrs! { "priority" => 1i64 });

    let result = reconciler
        .update(&widget("w1"), &attrs! { "priority" => 1i64 }, &observed, &CancellationToken::new())
        .await;

    assert!(client.requests().is_empty());
    verify_failed(&result.outcome, "unexpected_status").unwrap();
    assert!(result.has_errors());
}

#[tokio::test(start_paused = true)]
async fn test_update_failure_keeps_applied_groups() {
    let client = Arc::new(
        ScriptedClient::new([Step::status("VALID")])
            .with_mutations([MutateStep::Ack(MutationAck::default()), MutateStep::Fatal]),
    );
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());
    let observed = ObservedState::present(
        widget("w1"),
        "VALID",
        attrs! { "priority" => 1i64, "state" => "ENABLED" },
    );

    let result = reconciler
        .update(
            &widget("w1"),
            &attrs! { "priority" => 2i64, "state" => "DISABLED" },
            &observed,
            &CancellationToken::new(),
        )
        .await;

    verify_failed(&result.outcome, "fatal_mutation_error").unwrap();
    assert_eq!(result.mutations, 1);
    // No rollback call after the rejected group.
    assert_eq!(client.requests().len(), 2);
    assert_eq!(result.outcome.last_observed().map(|s| s.status.as_str()), Some("VALID"));
}

#[tokio::test(start_paused = true)]
async fn test_delete_drain_then_absence() {
    let client = Arc::new(ScriptedClient::new(statuses(&[
        Some("UPDATING"),
        Some("VALID"),
        Some("DISABLED"),
        Some("DELETING"),
        None,
    ])));
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());

    let result = reconciler.delete(&widget("w1"), &CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(ops(&client), vec![MutationOp::Disable, MutationOp::Delete]);
    assert_eq!(client.requests()[0].attrs, attrs! { "state" => "DISABLED" });
    let state = result.outcome.last_observed().unwrap();
    assert!(!state.exists);
    assert_eq!(client.probes(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_already_deleted_resource() {
    let client = Arc::new(
        ScriptedClient::new([Step::Absent]).with_mutations([MutateStep::NotFound]),
    );
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());

    let result = reconciler.delete(&widget("w1"), &CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(ops(&client), vec![MutationOp::Disable]);
    assert_eq!(client.probes(), 0);
    assert_eq!(result.diagnostics[0].severity, Severity::Info);
}

#[tokio::test(start_paused = true)]
async fn test_delete_shares_one_budget() {
    // Drain takes 40s of a 60s budget; the delete wait gets the remaining 20s.
    let mut steps = vec![Step::status("UPDATING"); 40];
    steps.push(Step::status("VALID"));
    steps.push(Step::status("DELETING"));
    let client = Arc::new(ScriptedClient::new(steps));
    let reconciler =
        widget_reconciler(client.clone(), Duration::from_secs(60), RetryPolicy::no_retry());

    let start = Instant::now();
    let result = reconciler.delete(&widget("w1"), &CancellationToken::new()).await;

    verify_timeout(&result.outcome, Some("DELETING")).unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(60));
    assert_eq!(ops(&client), vec![MutationOp::Disable, MutationOp::Delete]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_delete() {
    let client = Arc::new(ScriptedClient::new([Step::status("UPDATING")]));
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let result = reconciler.delete(&widget("w1"), &cancel).await;

    assert_eq!(result.phase(), Phase::Cancelled);
    assert_eq!(result.classification(), Some(ErrorClass::Transient));
    assert_eq!(ops(&client), vec![MutationOp::Disable]);
}

#[tokio::test]
async fn test_read_maps_absence_to_none() {
    let client = Arc::new(ScriptedClient::new(statuses(&[Some("VALID"), None])));
    let reconciler = widget_reconciler(client, BUDGET, RetryPolicy::no_retry());

    let cancel = CancellationToken::new();
    let first = reconciler.read(&widget("w1"), &cancel).await.unwrap();
    assert_eq!(first.map(|s| s.status.to_string()), Some("VALID".to_string()));
    assert!(reconciler.read(&widget("w1"), &cancel).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_read_retries_throttled_describe() {
    let client = Arc::new(ScriptedClient::new([
        Step::Transient,
        Step::Transient,
        Step::status("VALID"),
    ]));
    let retry = RetryPolicy::new(3, BackoffStrategy::Fixed, Duration::from_secs(2));
    let reconciler = widget_reconciler(client.clone(), BUDGET, retry);
    let start = Instant::now();

    let state = reconciler
        .read(&widget("w1"), &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state.status.as_str(), "VALID");
    assert_eq!(client.probes(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_read_gives_up_after_attempt_ceiling() {
    let client = Arc::new(ScriptedClient::new([Step::Transient]));
    let retry = RetryPolicy::new(2, BackoffStrategy::Fixed, Duration::from_secs(1));
    let reconciler = widget_reconciler(client.clone(), BUDGET, retry);

    let err = reconciler
        .read(&widget("w1"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ConvergeError::TransientProbe { count: 2, .. }));
    assert_eq!(client.probes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_retry_delay_capped_by_budget() {
    let client = Arc::new(
        ScriptedClient::new([Step::status("VALID")]).with_mutations(vec![MutateStep::Transient; 5]),
    );
    let retry = RetryPolicy::new(5, BackoffStrategy::Fixed, Duration::from_secs(60));
    let reconciler = widget_reconciler(client.clone(), Duration::from_secs(10), retry);
    let start = Instant::now();

    let result = reconciler
        .create(MutationRequest::create(widget("w1"), attrs! {}), &CancellationToken::new())
        .await;

    verify_failed(&result.outcome, "transient_mutation_error").unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(client.requests().len(), 1);
    assert_eq!(client.probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_create_ack_status_is_last_observation_until_described() {
    let client = Arc::new(
        ScriptedClient::new([Step::Transient])
            .with_mutations([MutateStep::Ack(MutationAck::default().status("CREATING"))]),
    );
    let reconciler = widget_reconciler(client.clone(), BUDGET, RetryPolicy::no_retry());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let result = reconciler
        .create(MutationRequest::create(widget("w1"), attrs! {}), &cancel)
        .await;

    assert_eq!(result.phase(), Phase::Cancelled);
    assert_eq!(
        result.outcome.last_observed().map(|s| s.status.as_str()),
        Some("CREATING")
    );
    assert_eq!(client.probes(), 1);
}
