//! Shared helpers for integration tests.
//!
//! `TestHost` plays the part of the external host: it runs one replay per
//! turn, records a scheduling event for every new action, and delivers the
//! completions on the following turn.
#![allow(dead_code)]


use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use durable_replay::actions::HTTP_ACTIVITY_NAME;
use durable_replay::{
    Action, DurableHttpResponse, HistoryEvent, HistoryEventKind, OrchestrationHandler, OrchestrationRequest,
    OrchestrationStatus, OrchestratorState, ReplayEngine, ReplayOptions, RequestMessage,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const TEST_INSTANCE: &str = "test-instance";
pub const TEST_ORCH_NAME: &str = "TestOrch";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(secs)
}

type CallFn = Box<dyn Fn(Option<Value>) -> Result<Value, String>>;

pub struct TestHost {
    engine: ReplayEngine,
    instance_id: String,
    history: Vec<HistoryEvent>,
    clock: DateTime<Utc>,
    activities: HashMap<String, CallFn>,
    sub_orchestrations: HashMap<String, CallFn>,
    /// Events delivered at the start of the next turn.
    inbox: Vec<HistoryEventKind>,
    /// sequence number -> record event id, for the current execution
    recorded: HashMap<u32, u64>,
    timers: BTreeMap<u64, DateTime<Utc>>,
    pub turns: Vec<OrchestratorState>,
}

impl TestHost {
    pub fn new(handler: Arc<dyn OrchestrationHandler>) -> Self {
        Self::with_options(handler, ReplayOptions::default())
    }

    pub fn with_options(handler: Arc<dyn OrchestrationHandler>, options: ReplayOptions) -> Self {
        Self {
            engine: ReplayEngine::with_options(handler, options),
            instance_id: TEST_INSTANCE.to_string(),
            history: Vec::new(),
            clock: t0(),
            activities: HashMap::new(),
            sub_orchestrations: HashMap::new(),
            inbox: Vec::new(),
            recorded: HashMap::new(),
            timers: BTreeMap::new(),
            turns: Vec::new(),
        }
    }

    pub fn activity(mut self, name: &str, f: impl Fn(Option<Value>) -> Result<Value, String> + 'static) -> Self {
        self.activities.insert(name.to_string(), Box::new(f));
        self
    }

    pub fn sub_orchestration(
        mut self,
        name: &str,
        f: impl Fn(Option<Value>) -> Result<Value, String> + 'static,
    ) -> Self {
        self.sub_orchestrations.insert(name.to_string(), Box::new(f));
        self
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Queue an external event for the next turn.
    pub fn raise_event(&mut self, name: &str, input: Option<Value>) {
        self.inbox.push(HistoryEventKind::EventRaised {
            name: name.to_string(),
            input,
        });
    }

    pub fn start(&mut self, input: Option<Value>) -> OrchestratorState {
        self.inbox.insert(
            0,
            HistoryEventKind::ExecutionStarted {
                name: TEST_ORCH_NAME.to_string(),
                input,
            },
        );
        self.turn()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.inbox.is_empty() || !self.timers.is_empty()
    }

    /// Deliver pending events and run the orchestration once.
    pub fn turn(&mut self) -> OrchestratorState {
        if self.inbox.is_empty() {
            if let Some(&earliest) = self.timers.values().min() {
                self.clock = self.clock.max(earliest);
            }
        }
        self.clock += TimeDelta::seconds(1);

        let mut delivered = vec![HistoryEventKind::OrchestratorStarted];
        delivered.append(&mut self.inbox);
        let due: Vec<(u64, DateTime<Utc>)> = self
            .timers
            .iter()
            .filter(|&(_, fire_at)| *fire_at <= self.clock)
            .map(|(&id, &fire_at)| (id, fire_at))
            .collect();
        for (timer_id, fire_at) in due {
            self.timers.remove(&timer_id);
            delivered.push(HistoryEventKind::TimerFired { timer_id, fire_at });
        }
        for kind in delivered {
            self.push(kind);
        }

        let request = OrchestrationRequest::new(self.instance_id.clone(), self.history.clone());
        let state = self.engine.run(request);
        for event in &mut self.history {
            event.is_played = true;
        }
        self.apply_actions(&state);
        self.turns.push(state.clone());
        state
    }

    /// Run turns until the orchestration finishes or waits on something only a test can deliver.
    pub fn run_to_completion(&mut self, input: Option<Value>) -> OrchestratorState {
        let mut state = self.start(input);
        for _ in 0..200 {
            match state.status {
                OrchestrationStatus::Completed | OrchestrationStatus::Failed => return state,
                OrchestrationStatus::Running if !self.has_pending_work() => return state,
                _ => state = self.turn(),
            }
        }
        panic!("orchestration did not settle after 200 turns: {state:?}");
    }

    /// Replay the full recorded history once more without delivering anything new.
    pub fn replay(&self) -> OrchestratorState {
        let mut history = self.history.clone();
        for event in &mut history {
            event.is_played = true;
        }
        self.engine
            .run(OrchestrationRequest::new(self.instance_id.clone(), history))
    }

    fn push(&mut self, kind: HistoryEventKind) -> u64 {
        let event_id = self.history.len() as u64;
        self.history.push(HistoryEvent::new(event_id, self.clock, kind));
        event_id
    }

    fn record(&mut self, sequence_number: u32, kind: HistoryEventKind) -> u64 {
        let id = self.push(kind);
        self.recorded.insert(sequence_number, id);
        id
    }

    fn apply_actions(&mut self, state: &OrchestratorState) {
        for pending in &state.actions {
            let seq = pending.sequence_number;
            match &pending.action {
                Action::CallActivity {
                    function_name, input, ..
                } => {
                    let id = self.record(
                        seq,
                        HistoryEventKind::TaskScheduled {
                            name: function_name.clone(),
                            input: input.clone(),
                        },
                    );
                    let outcome = match self.activities.get(function_name) {
                        Some(f) => f(input.clone()),
                        None => Err(format!("unknown activity {function_name}")),
                    };
                    self.inbox.push(task_outcome(id, outcome));
                }
                Action::CallHttp { http_request } => {
                    let id = self.record(
                        seq,
                        HistoryEventKind::TaskScheduled {
                            name: HTTP_ACTIVITY_NAME.to_string(),
                            input: serde_json::to_value(http_request).ok(),
                        },
                    );
                    let response = DurableHttpResponse {
                        status_code: 200,
                        headers: BTreeMap::new(),
                        content: Some(format!("{} {}", http_request.method, http_request.uri)),
                    };
                    self.inbox.push(HistoryEventKind::TaskCompleted {
                        task_scheduled_id: id,
                        result: serde_json::to_value(response).ok(),
                    });
                }
                Action::CreateTimer { fire_at, is_canceled } => match self.recorded.get(&seq) {
                    Some(id) => {
                        if *is_canceled {
                            self.timers.remove(id);
                        }
                    }
                    None => {
                        let id = self.record(seq, HistoryEventKind::TimerCreated { fire_at: *fire_at });
                        if !*is_canceled {
                            self.timers.insert(id, *fire_at);
                        }
                    }
                },
                Action::CallSubOrchestrator {
                    function_name,
                    instance_id,
                    input,
                    ..
                } => {
                    let id = self.record(
                        seq,
                        HistoryEventKind::SubOrchestrationInstanceCreated {
                            name: function_name.clone(),
                            instance_id: instance_id.clone(),
                            input: input.clone(),
                        },
                    );
                    let outcome = match self.sub_orchestrations.get(function_name) {
                        Some(f) => f(input.clone()),
                        None => Err(format!("unknown orchestration {function_name}")),
                    };
                    self.inbox.push(match outcome {
                        Ok(result) => HistoryEventKind::SubOrchestrationInstanceCompleted {
                            task_scheduled_id: id,
                            result: Some(result),
                        },
                        Err(reason) => HistoryEventKind::SubOrchestrationInstanceFailed {
                            task_scheduled_id: id,
                            reason,
                            details: None,
                        },
                    });
                }
                Action::CallEntity {
                    entity_id,
                    operation,
                    input,
                    request_id,
                }
                | Action::SignalEntity {
                    entity_id,
                    operation,
                    input,
                    request_id,
                } => {
                    let signal = matches!(pending.action, Action::SignalEntity { .. });
                    let message = if signal {
                        RequestMessage::signal(request_id, operation, input.clone(), Some(self.instance_id.clone()))
                    } else {
                        RequestMessage::operation(request_id, operation, input.clone(), Some(self.instance_id.clone()))
                    };
                    self.record(
                        seq,
                        HistoryEventKind::EventSent {
                            instance_id: entity_id.scheduler_id(),
                            name: "op".to_string(),
                            input: serde_json::to_value(message).ok(),
                        },
                    );
                }
                Action::AcquireLock {
                    critical_section_id,
                    lock_set,
                } => {
                    let message = RequestMessage::lock(critical_section_id, self.instance_id.clone(), lock_set.clone());
                    self.record(
                        seq,
                        HistoryEventKind::EventSent {
                            instance_id: lock_set[0].scheduler_id(),
                            name: "op".to_string(),
                            input: serde_json::to_value(message).ok(),
                        },
                    );
                }
                Action::ReleaseLock {
                    critical_section_id,
                    lock_set,
                } => {
                    let message =
                        RequestMessage::release(critical_section_id, self.instance_id.clone(), lock_set.clone());
                    self.record(
                        seq,
                        HistoryEventKind::EventSent {
                            instance_id: lock_set[0].scheduler_id(),
                            name: "release".to_string(),
                            input: serde_json::to_value(message).ok(),
                        },
                    );
                }
                Action::WaitForExternalEvent { .. } => {}
                Action::ContinueAsNew {
                    input,
                    preserve_unprocessed_events,
                } => {
                    self.push(HistoryEventKind::ContinueAsNew { input: input.clone() });
                    self.recorded.clear();
                    self.timers.clear();
                    if *preserve_unprocessed_events {
                        self.inbox
                            .retain(|kind| matches!(kind, HistoryEventKind::EventRaised { .. }));
                    } else {
                        self.inbox.clear();
                    }
                    self.push(HistoryEventKind::ExecutionStarted {
                        name: TEST_ORCH_NAME.to_string(),
                        input: input.clone(),
                    });
                }
            }
        }
    }
}

fn task_outcome(task_scheduled_id: u64, outcome: Result<Value, String>) -> HistoryEventKind {
    match outcome {
        Ok(result) => HistoryEventKind::TaskCompleted {
            task_scheduled_id,
            result: Some(result),
        },
        Err(reason) => HistoryEventKind::TaskFailed {
            task_scheduled_id,
            reason,
            details: None,
        },
    }
}

/// Kind names of the actions in a turn's batch, in order.
pub fn action_kinds(state: &OrchestratorState) -> Vec<&'static str> {
    state.actions.iter().map(|a| a.action.kind_name()).collect()
}
