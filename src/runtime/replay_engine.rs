use super::{OrchestrationHandler, OrchestrationRequest, OrchestrationStatus, OrchestratorState, ReplayOptions};
use crate::OrchestrationContext;
use crate::errors::{AppErrorKind, ErrorDetails, Fault, panic_message};
use crate::history::{HistoryEvent, HistoryEventKind, current_execution};
use futures::task::noop_waker_ref;
use serde_json::Value;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// How the procedure stopped within one run.
enum Stop {
    Returned(Result<Value, Fault>),
    Panicked(String),
    /// Pending with no further progress possible.
    Suspended,
}

/// Replays history against an orchestration and computes its next state.
///
/// The engine is a trampoline: it polls the procedure with a no-op waker and,
/// whenever the procedure cannot make progress, feeds it the next history
/// event. It never performs side effects itself; everything new is returned as
/// actions in [`OrchestratorState::actions`].
pub struct ReplayEngine {
    handler: Arc<dyn OrchestrationHandler>,
    options: ReplayOptions,
}

impl ReplayEngine {
    pub fn new(handler: Arc<dyn OrchestrationHandler>) -> Self {
        Self::with_options(handler, ReplayOptions::default())
    }

    pub fn with_options(handler: Arc<dyn OrchestrationHandler>, options: ReplayOptions) -> Self {
        Self { handler, options }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    /// Run the orchestration once against `request.history`.
    pub fn run(&self, request: OrchestrationRequest) -> OrchestratorState {
        let OrchestrationRequest {
            instance_id,
            parent_instance_id,
            input,
            history,
        } = request;
        let history = current_execution(history);
        let input = input.or_else(|| execution_input(&history));

        debug!(
            target: "durable_replay::orchestration",
            instance_id = %instance_id,
            history_len = history.len(),
            "starting orchestration run"
        );

        let ctx = OrchestrationContext::new(instance_id.clone(), parent_instance_id, history, &self.options);
        let mut fut = self.handler.invoke(ctx.clone(), input);

        let stop = loop {
            match catch_unwind(AssertUnwindSafe(|| poll_once(fut.as_mut()))) {
                Ok(Poll::Ready(result)) => {
                    // events recorded after the return point still settle timers the procedure left behind
                    let mut inner = ctx.guard();
                    while !inner.should_stop() && inner.advance() {}
                    break Stop::Returned(result);
                }
                Err(payload) => break Stop::Panicked(panic_message(&*payload)),
                Ok(Poll::Pending) => {
                    let mut inner = ctx.guard();
                    if inner.should_stop() || !inner.advance() {
                        break Stop::Suspended;
                    }
                }
            }
        };
        drop(fut);

        let state = self.finish(&ctx, stop);
        debug!(
            target: "durable_replay::orchestration",
            instance_id = %instance_id,
            status = ?state.status,
            actions = state.actions.len(),
            "orchestration run finished"
        );
        state
    }

    /// Host boundary: JSON `OrchestrationRequest` in, JSON `OrchestratorState` out.
    pub fn run_json(&self, request: &str) -> Result<String, serde_json::Error> {
        let request: OrchestrationRequest = serde_json::from_str(request)?;
        serde_json::to_string(&self.run(request))
    }

    fn finish(&self, ctx: &OrchestrationContext, stop: Stop) -> OrchestratorState {
        let summary = ctx.guard().summarize();
        let custom_status = summary.custom_status;

        if let Some(error) = summary.abort {
            return fatal(error, custom_status);
        }
        if let Some((input, action)) = summary.continue_as_new {
            let mut actions = summary.actions;
            actions.push(action);
            return OrchestratorState {
                status: OrchestrationStatus::ContinuedAsNew,
                output: input,
                error: None,
                actions,
                custom_status,
            };
        }
        if let Some(message) = summary.unclaimed_record {
            warn!(target: "durable_replay::orchestration", error = %message, "history does not match orchestration");
            return fatal(ErrorDetails::nondeterminism(message), custom_status);
        }

        let actions = summary.actions;
        match stop {
            Stop::Returned(Ok(_)) if self.options.wait_for_outstanding_timers && summary.outstanding_timers > 0 => {
                debug!(
                    target: "durable_replay::orchestration",
                    outstanding_timers = summary.outstanding_timers,
                    "orchestration returned with timers outstanding"
                );
                running(actions, custom_status)
            }
            Stop::Returned(Ok(output)) => OrchestratorState {
                status: OrchestrationStatus::Completed,
                output: Some(output),
                error: None,
                actions,
                custom_status,
            },
            Stop::Returned(Err(fault)) => OrchestratorState {
                status: OrchestrationStatus::Failed,
                output: None,
                error: Some(ErrorDetails::from_fault(&fault)),
                actions,
                custom_status,
            },
            Stop::Panicked(message) => OrchestratorState {
                status: OrchestrationStatus::Failed,
                output: None,
                error: Some(ErrorDetails::Application {
                    kind: AppErrorKind::Panicked,
                    message,
                    details: None,
                    retryable: false,
                }),
                actions: Vec::new(),
                custom_status,
            },
            Stop::Suspended => running(actions, custom_status),
        }
    }
}

fn running(actions: Vec<crate::actions::PendingAction>, custom_status: Option<Value>) -> OrchestratorState {
    OrchestratorState {
        status: OrchestrationStatus::Running,
        output: None,
        error: None,
        actions,
        custom_status,
    }
}

fn fatal(error: ErrorDetails, custom_status: Option<Value>) -> OrchestratorState {
    OrchestratorState {
        status: OrchestrationStatus::Failed,
        output: None,
        error: Some(error),
        actions: Vec::new(),
        custom_status,
    }
}

fn execution_input(history: &[HistoryEvent]) -> Option<Value> {
    history.iter().find_map(|e| match &e.kind {
        HistoryEventKind::ExecutionStarted { input, .. } => input.clone(),
        _ => None,
    })
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(noop_waker_ref());
    fut.poll(&mut cx)
}
