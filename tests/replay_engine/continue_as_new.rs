//! Continue-As-New Tests

use super::helpers::*;
use std::time::Duration;

/// Orchestration code:
/// ```ignore
/// let n = input.as_u64().unwrap_or(0);
/// if n >= 3 { return Ok(json!(n)); }
/// ctx.create_timer_after(1s).await?;
/// ctx.continue_as_new(n + 1);
/// Ok(Value::Null)
/// ```
async fn eternal_counter(ctx: OrchestrationContext, input: Option<Value>) -> Result<Value, Fault> {
    let n = input.as_ref().and_then(Value::as_u64).unwrap_or(0);
    if n >= 3 {
        return Ok(json!(n));
    }
    ctx.create_timer_after(Duration::from_secs(1)).await?;
    ctx.continue_as_new(n + 1);
    Ok(Value::Null)
}

fn first_generation() -> Vec<HistoryEvent> {
    vec![
        started(0, 0),
        execution_started(1, json!(0)),
        timer_created(2, 1),
        timer_fired(3, 2, 1),
    ]
}

#[test]
fn continue_as_new_reports_the_next_input() {
    let state = run(orchestration(eternal_counter), first_generation());
    assert_eq!(state.status, OrchestrationStatus::ContinuedAsNew);
    assert!(state.is_done());
    assert_eq!(state.output, Some(json!(1)));
    let last = state.actions.last().expect("continue-as-new action");
    assert_eq!(
        last.action,
        Action::ContinueAsNew {
            input: Some(json!(1)),
            preserve_unprocessed_events: false,
        }
    );
}

/// Only events after the last ContinueAsNew record belong to the current execution.
#[test]
fn earlier_generations_are_ignored() {
    let mut history = first_generation();
    history.push(continued_as_new(4, json!(1)));
    history.extend(unplayed(vec![started(5, 2), execution_started(6, json!(1))]));
    let state = run(orchestration(eternal_counter), history);
    assert_running(&state);
    assert_eq!(state.actions.len(), 1);
    assert_eq!(state.actions[0].sequence_number, 0, "sequence numbers restart per execution");
    assert_eq!(
        state.actions[0].action,
        Action::CreateTimer {
            fire_at: at(3),
            is_canceled: false,
        }
    );
}

#[test]
fn preserving_unprocessed_events_is_flagged_on_the_action() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.continue_as_new_preserving_events(json!({ "generation": 2 }));
        Ok::<Value, Fault>(Value::Null)
    });
    let state = run(handler, unplayed(vec![started(0, 0)]));
    assert_eq!(state.status, OrchestrationStatus::ContinuedAsNew);
    assert_eq!(
        state.actions,
        vec![durable_replay::PendingAction {
            sequence_number: 0,
            action: Action::ContinueAsNew {
                input: Some(json!({ "generation": 2 })),
                preserve_unprocessed_events: true,
            },
        }]
    );
}

/// Work issued before continuing is still handed to the host, ahead of the restart.
#[test]
fn earlier_actions_go_out_with_the_restart() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        let counter = EntityId::new("counter", "c1").map_err(Fault::from)?;
        ctx.signal_entity(counter, "add", 1);
        ctx.continue_as_new(Value::Null);
        Ok::<Value, Fault>(Value::Null)
    });
    let state = run(handler, unplayed(vec![started(0, 0)]));
    assert_eq!(action_kinds(&state), vec!["SignalEntity", "ContinueAsNew"]);
    assert_eq!(state.output, None);
}

/// A fatal error wins over a requested restart.
#[test]
fn validation_error_beats_continue_as_new() {
    let handler = orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
        ctx.continue_as_new(1);
        ctx.call_activity("", Value::Null).await
    });
    let state = run(handler, unplayed(vec![started(0, 0)]));
    assert_fatal(&state, ConfigErrorKind::Validation);
}

#[test]
fn hosted_counter_restarts_until_done() {
    let mut host = TestHost::new(orchestration(eternal_counter));
    let state = host.run_to_completion(Some(json!(0)));
    assert_completed(&state, json!(3));

    let restarts = host
        .history()
        .iter()
        .filter(|e| matches!(e.kind, HistoryEventKind::ContinueAsNew { .. }))
        .count();
    assert_eq!(restarts, 3);
    let continued = host
        .turns
        .iter()
        .filter(|s| s.status == OrchestrationStatus::ContinuedAsNew)
        .count();
    assert_eq!(continued, 3);
    assert_eq!(host.replay(), state);
}
