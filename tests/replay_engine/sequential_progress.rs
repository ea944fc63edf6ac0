//! Sequential Progress Tests
//!
//! Function chaining across several invocations, replaying recorded results.

use super::helpers::*;
use std::sync::{Arc, Mutex};

/// Orchestration code:
/// ```ignore
/// let tokyo = ctx.call_activity("SayHello", "Tokyo").await?;
/// let seattle = ctx.call_activity("SayHello", "Seattle").await?;
/// let cairo = ctx.call_activity("SayHello", "Cairo").await?;
/// Ok(json!([tokyo, seattle, cairo]))
/// ```
async fn hello_cities(ctx: OrchestrationContext, _input: Option<Value>) -> Result<Value, Fault> {
    let tokyo = ctx.call_activity("SayHello", "Tokyo").await?;
    let seattle = ctx.call_activity("SayHello", "Seattle").await?;
    let cairo = ctx.call_activity("SayHello", "Cairo").await?;
    Ok(json!([tokyo, seattle, cairo]))
}

fn say_hello(input: Option<Value>) -> Result<Value, String> {
    let city = input.and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
    Ok(json!(format!("Hello {city}!")))
}

#[test]
fn first_run_schedules_tokyo() {
    let history = unplayed(vec![started(0, 0), execution_started(1, Value::Null)]);
    let state = run(orchestration(hello_cities), history);
    assert_running(&state);
    assert_eq!(state.actions.len(), 1);
    match &state.actions[0].action {
        Action::CallActivity {
            function_name, input, ..
        } => {
            assert_eq!(function_name, "SayHello");
            assert_eq!(input, &Some(json!("Tokyo")));
        }
        other => panic!("unexpected action {other:?}"),
    }
}

/// Tokyo's result is replayed; Seattle is the only new action and gets sequence number 1.
#[test]
fn second_run_schedules_seattle() {
    let history = vec![
        started(0, 0),                                  // first invocation
        execution_started(1, Value::Null),              //
        task_scheduled(2, "SayHello", json!("Tokyo")),  // call_activity("Tokyo")
        started(3, 5),                                  // second invocation
        task_completed(4, 2, json!("Hello Tokyo!")),    // Tokyo done
    ];
    let state = run(orchestration(hello_cities), history);
    assert_running(&state);
    assert_eq!(state.actions.len(), 1);
    assert_eq!(state.actions[0].sequence_number, 1);
    match &state.actions[0].action {
        Action::CallActivity { input, .. } => assert_eq!(input, &Some(json!("Seattle"))),
        other => panic!("unexpected action {other:?}"),
    }
}

#[test]
fn full_history_completes_with_all_greetings() {
    let history = vec![
        started(0, 0),
        execution_started(1, Value::Null),
        task_scheduled(2, "SayHello", json!("Tokyo")),
        started(3, 5),
        task_completed(4, 2, json!("Hello Tokyo!")),
        task_scheduled(5, "SayHello", json!("Seattle")),
        started(6, 10),
        task_completed(7, 5, json!("Hello Seattle!")),
        task_scheduled(8, "SayHello", json!("Cairo")),
        started(9, 15),
        task_completed(10, 8, json!("Hello Cairo!")),
    ];
    let state = run(orchestration(hello_cities), history);
    assert_completed(&state, json!(["Hello Tokyo!", "Hello Seattle!", "Hello Cairo!"]));
    assert!(state.actions.is_empty());
}

/// A failure surfaces at the await that asked for it and aborts the chain.
#[test]
fn failed_activity_propagates_through_question_mark() {
    let history = vec![
        started(0, 0),
        execution_started(1, Value::Null),
        task_scheduled(2, "SayHello", json!("Tokyo")),
        started(3, 5),
        task_failed(4, 2, "Tokyo is unreachable"),
    ];
    let state = run(orchestration(hello_cities), history);
    assert_failed(&state, "Tokyo is unreachable");
    assert!(state.actions.is_empty());
}

#[test]
fn hosted_chain_runs_to_completion() {
    let mut host = TestHost::new(orchestration(hello_cities)).activity("SayHello", say_hello);
    let state = host.run_to_completion(None);
    assert_completed(&state, json!(["Hello Tokyo!", "Hello Seattle!", "Hello Cairo!"]));
    assert_eq!(host.turns.len(), 4, "one turn per activity plus the final one");

    let replayed = host.replay();
    assert_eq!(replayed, state, "replaying the final history must reproduce the outcome");
}

/// The deterministic clock advances with each recorded OrchestratorStarted.
#[test]
fn clock_follows_orchestrator_started_events() {
    let history = vec![
        started(0, 0),
        execution_started(1, Value::Null),
        task_scheduled(2, "A", Value::Null),
        started(3, 30),
        task_completed(4, 2, Value::Null),
    ];
    let state = run(
        orchestration(|ctx: OrchestrationContext, _input: Option<Value>| async move {
            let before = ctx.current_utc_date_time();
            ctx.call_activity("A", Value::Null).await?;
            let after = ctx.current_utc_date_time();
            Ok::<Value, Fault>(json!([before, after]))
        }),
        history,
    );
    assert_completed(&state, json!([at(0), at(30)]));
}

/// `is_replaying` is true while replaying played events and flips once new events are reached.
#[test]
fn is_replaying_flips_at_the_first_new_event() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let handler = orchestration(move |ctx: OrchestrationContext, _input: Option<Value>| {
        let observed = observed.clone();
        async move {
            observed.lock().unwrap().push(ctx.is_replaying());
            ctx.call_activity("A", Value::Null).await?;
            observed.lock().unwrap().push(ctx.is_replaying());
            ctx.call_activity("B", Value::Null).await?;
            observed.lock().unwrap().push(ctx.is_replaying());
            Ok::<Value, Fault>(Value::Null)
        }
    });
    let mut history = vec![
        started(0, 0),
        execution_started(1, Value::Null),
        task_scheduled(2, "A", Value::Null),
        started(3, 5),
        task_completed(4, 2, Value::Null),
        task_scheduled(5, "B", Value::Null),
    ];
    history.extend(unplayed(vec![started(6, 10), task_completed(7, 5, Value::Null)]));
    let state = run(handler, history);
    assert_completed(&state, Value::Null);
    assert_eq!(*seen.lock().unwrap(), vec![true, true, false]);
}
