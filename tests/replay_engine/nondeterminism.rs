//! Nondeterminism Detection Tests
//!
//! Replays histories that no longer match the orchestration code. Every case
//! must end in a fatal, non-retryable error with an empty action batch.

use super::helpers::*;

fn message(state: &OrchestratorState) -> String {
    match &state.error {
        Some(ErrorDetails::Configuration { message, .. }) => message.clone().unwrap_or_default(),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

fn activity_recorded() -> Vec<HistoryEvent> {
    vec![
        started(0, 0),
        execution_started(1, Value::Null),
        task_scheduled(2, "A", json!("x")),
    ]
}

#[test]
fn timer_issued_where_activity_was_recorded() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.create_timer(at(10)).await?;
        ctx.call_activity("A", "x").await
    });
    let state = run(handler, activity_recorded());
    assert_nondeterminism(&state);
    let msg = message(&state);
    assert!(msg.contains("schedule order mismatch"), "{msg}");
    assert!(msg.contains("TaskScheduled('A')"), "{msg}");
    assert!(msg.contains("CreateTimer"), "{msg}");
    assert!(!state.error.as_ref().unwrap().is_retryable());
}

#[test]
fn renamed_activity_is_detected() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.call_activity("B", "x").await
    });
    let state = run(handler, activity_recorded());
    assert_nondeterminism(&state);
    assert!(message(&state).contains("CallActivity('B')"));
}

/// The code no longer issues a call that history says it made.
#[test]
fn removed_call_leaves_an_unclaimed_record() {
    let mut history = activity_recorded();
    history.extend([
        started(3, 5),
        task_completed(4, 2, json!("a")),
        task_scheduled(5, "B", Value::Null),
    ]);
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.call_activity("A", "x").await
    });
    let state = run(handler, history);
    assert_nondeterminism(&state);
    let msg = message(&state);
    assert!(msg.contains("did not issue"), "{msg}");
    assert!(msg.contains("TaskScheduled('B')"), "{msg}");
}

#[test]
fn completion_without_matching_schedule() {
    let mut history = activity_recorded();
    history.push(task_completed(3, 9, json!("orphan")));
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.call_activity("A", "x").await
    });
    let state = run(handler, history);
    assert_nondeterminism(&state);
    assert!(message(&state).contains("no matching schedule"));
}

#[test]
fn timer_fired_for_an_activity_record() {
    let mut history = activity_recorded();
    history.push(timer_fired(3, 2, 10));
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.call_activity("A", "x").await
    });
    let state = run(handler, history);
    assert_nondeterminism(&state);
    assert!(message(&state).contains("completion kind mismatch"));
}

/// Inputs are ignored when matching unless strict matching is enabled.
#[test]
fn changed_input_only_fails_with_strict_matching() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.call_activity("A", "y").await
    });

    let lenient = run(handler.clone(), activity_recorded());
    assert_running(&lenient);
    assert!(lenient.actions.is_empty(), "the recorded call is claimed, nothing new is issued");

    let strict = ReplayOptions {
        strict_input_matching: true,
        ..Default::default()
    };
    let state = run_with_options(handler, strict, activity_recorded());
    assert_nondeterminism(&state);
}

/// Deploying different code against an existing instance.
#[test]
fn code_swap_after_hosted_progress() {
    let v1 = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        let a = ctx.call_activity("A", Value::Null).await?;
        let b = ctx.call_activity("B", Value::Null).await?;
        Ok::<Value, Fault>(json!([a, b]))
    });
    let mut host = TestHost::new(v1)
        .activity("A", |_| Ok(json!("a")))
        .activity("B", |_| Ok(json!("b")));
    let state = host.run_to_completion(None);
    assert_completed(&state, json!(["a", "b"]));

    let v2 = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        let a = ctx.call_activity("A", Value::Null).await?;
        ctx.create_timer_after(std::time::Duration::from_secs(5)).await?;
        let b = ctx.call_activity("B", Value::Null).await?;
        Ok::<Value, Fault>(json!([a, b]))
    });
    let history: Vec<HistoryEvent> = host.history().iter().cloned().map(HistoryEvent::played).collect();
    let replayed = run(v2, history);
    assert_nondeterminism(&replayed);
}
