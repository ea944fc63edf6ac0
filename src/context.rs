//! The orchestration context and the task arena behind it.
//!
//! Every [`Task`] handed to orchestration code is an index into `CtxInner::tasks`.
//! A task is *yielded* the first time it is awaited (directly or through a task
//! set). Yielding assigns the next sequence number and claims the next
//! scheduling record in history by position; with no record left the action is
//! new and joins the outgoing batch. Completions are applied one history event
//! at a time by [`CtxInner::advance`], which the replay engine calls whenever
//! the orchestration cannot make progress.

use crate::actions::{Action, DurableHttpRequest, PendingAction, RetryOptions};
use crate::entities::{EntityId, ResponseMessage};
use crate::errors::{ErrorDetails, Fault, ValidationError};
use crate::futures::{Task, TaskSet, TimerTask};
use crate::history::{HistoryEvent, HistoryEventKind};
use crate::runtime::ReplayOptions;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) type TaskId = usize;

const GUID_NAMESPACE: Uuid = Uuid::from_u128(0x9e95_2958_5e33_4daf_827f_2fa1_2937_b875);

#[derive(Debug, Clone)]
pub(crate) enum TaskState {
    Pending,
    Completed(Value),
    Faulted(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetMode {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    EntityResult,
    LockGranted,
}

#[derive(Debug, Clone, Copy)]
enum RetryPhase {
    Attempt(TaskId),
    Backoff(TaskId),
}

#[derive(Debug)]
pub(crate) struct RetryState {
    template: Action,
    options: RetryOptions,
    attempt: u32,
    phase: Option<RetryPhase>,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) enum TaskKind {
    /// Answered by a completion event correlated with its scheduling record.
    Scheduled { action: Action },
    /// Claims an `EventSent` record and is answered by an `EventRaised` named `response_name`.
    Request {
        action: Action,
        response_name: String,
        response: ResponseKind,
    },
    External { name: String },
    Set {
        mode: SetMode,
        members: Vec<TaskId>,
        winner: Option<TaskId>,
    },
    Retry(RetryState),
    /// Handed out when construction failed; the run is already aborted.
    Invalid,
}

#[derive(Debug)]
pub(crate) struct TaskNode {
    pub(crate) kind: TaskKind,
    pub(crate) state: TaskState,
    pub(crate) completion_index: Option<u64>,
    pub(crate) sequence_number: Option<u32>,
    yielded: bool,
    pub(crate) canceled: bool,
    new_actions: Vec<PendingAction>,
    parents: Vec<TaskId>,
}

impl TaskNode {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            state: TaskState::Pending,
            completion_index: None,
            sequence_number: None,
            yielded: false,
            canceled: false,
            new_actions: Vec::new(),
            parents: Vec::new(),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, TaskState::Pending)
    }

    fn is_timer(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Scheduled {
                action: Action::CreateTimer { .. }
            }
        )
    }

    pub(crate) fn action(&self) -> Option<&Action> {
        match &self.kind {
            TaskKind::Scheduled { action } | TaskKind::Request { action, .. } => Some(action),
            TaskKind::Retry(retry) => Some(&retry.template),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BatchEntry {
    task: Option<TaskId>,
    pending: PendingAction,
}

/// Outcome of a run as seen by the context, consumed by the replay engine.
#[derive(Debug, Default)]
pub(crate) struct RunSummary {
    pub(crate) actions: Vec<PendingAction>,
    pub(crate) custom_status: Option<Value>,
    pub(crate) continue_as_new: Option<(Option<Value>, PendingAction)>,
    pub(crate) abort: Option<ErrorDetails>,
    pub(crate) unclaimed_record: Option<String>,
    pub(crate) outstanding_timers: usize,
}

pub(crate) struct CtxInner {
    instance_id: String,
    parent_instance_id: Option<String>,
    history: Vec<HistoryEvent>,
    cursor: usize,
    /// History positions of scheduling records, in order.
    records: Vec<usize>,
    next_record: usize,
    record_tasks: HashMap<u64, TaskId>,
    /// Completions whose record no task has claimed yet, keyed by record id.
    buffered_completions: HashMap<u64, usize>,
    buffered_events: HashMap<String, VecDeque<usize>>,
    waiters: HashMap<String, VecDeque<TaskId>>,
    pub(crate) tasks: Vec<TaskNode>,
    next_sequence: u32,
    batch: Vec<BatchEntry>,
    /// Every action given a sequence number this run, whether replayed from history or new.
    issued: Vec<PendingAction>,
    current_time: DateTime<Utc>,
    guid_counter: u64,
    held_locks: Option<(String, Vec<EntityId>)>,
    custom_status: Option<Value>,
    continue_as_new: Option<(Option<Value>, PendingAction)>,
    pub(crate) abort: Option<ErrorDetails>,
    strict_input_matching: bool,
}

impl CtxInner {
    fn new(
        instance_id: String,
        parent_instance_id: Option<String>,
        history: Vec<HistoryEvent>,
        options: &ReplayOptions,
    ) -> Self {
        let records = history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_scheduling_record())
            .map(|(pos, _)| pos)
            .collect();
        let current_time = history
            .iter()
            .find(|e| matches!(e.kind, HistoryEventKind::OrchestratorStarted))
            .or_else(|| history.first())
            .map(|e| e.timestamp)
            .unwrap_or_default();
        Self {
            instance_id,
            parent_instance_id,
            history,
            cursor: 0,
            records,
            next_record: 0,
            record_tasks: HashMap::new(),
            buffered_completions: HashMap::new(),
            buffered_events: HashMap::new(),
            waiters: HashMap::new(),
            tasks: Vec::new(),
            next_sequence: 0,
            batch: Vec::new(),
            issued: Vec::new(),
            current_time,
            guid_counter: 0,
            held_locks: None,
            custom_status: None,
            continue_as_new: None,
            abort: None,
            strict_input_matching: options.strict_input_matching,
        }
    }

    fn is_replaying(&self) -> bool {
        self.history.get(self.cursor).is_some_and(|e| e.is_played)
    }

    fn new_guid(&mut self) -> Uuid {
        let name = format!(
            "{}_{}_{}",
            self.instance_id,
            self.current_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.guid_counter
        );
        self.guid_counter += 1;
        Uuid::new_v5(&GUID_NAMESPACE, name.as_bytes())
    }

    fn add_task(&mut self, kind: TaskKind) -> TaskId {
        self.tasks.push(TaskNode::new(kind));
        self.tasks.len() - 1
    }

    pub(crate) fn abort_with(&mut self, error: ErrorDetails) {
        if self.abort.is_none() {
            warn!(
                target: "durable_replay::orchestration",
                instance_id = %self.instance_id,
                error = %error,
                "orchestration run aborted"
            );
            self.abort = Some(error);
        }
    }

    fn invalid(&mut self, error: impl Into<ErrorDetails>) -> TaskId {
        self.abort_with(error.into());
        self.add_task(TaskKind::Invalid)
    }

    fn next_sequence_number(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    // ---------------------------------------------------------------------
    // Yielding
    // ---------------------------------------------------------------------

    pub(crate) fn yield_task(&mut self, id: TaskId) {
        if self.tasks[id].yielded || self.abort.is_some() {
            return;
        }
        self.tasks[id].yielded = true;
        let issued_start = self.issued.len();

        match &self.tasks[id].kind {
            TaskKind::Scheduled { .. } => self.issue(id),
            TaskKind::Request { response_name, .. } => {
                let response_name = response_name.clone();
                self.issue(id);
                if self.abort.is_none() {
                    self.attach_waiter(id, response_name);
                }
            }
            TaskKind::External { name } => {
                let name = name.clone();
                let seq = self.next_sequence_number();
                self.tasks[id].sequence_number = Some(seq);
                let pending = PendingAction {
                    sequence_number: seq,
                    action: Action::WaitForExternalEvent {
                        external_event_name: name.clone(),
                    },
                };
                self.issued.push(pending.clone());
                self.batch.push(BatchEntry { task: Some(id), pending });
                self.attach_waiter(id, name);
            }
            TaskKind::Set { members, .. } => {
                for member in members.clone() {
                    self.yield_task(member);
                }
            }
            TaskKind::Retry(_) => self.start_attempt(id),
            TaskKind::Invalid => {}
        }

        self.tasks[id].new_actions = self.issued[issued_start..].to_vec();
    }

    /// Assign a sequence number and either bind the task to its recorded
    /// scheduling event or add its action to the batch.
    fn issue(&mut self, id: TaskId) {
        let seq = self.next_sequence_number();
        let instance_id = self.instance_id.clone();
        let node = &mut self.tasks[id];
        node.sequence_number = Some(seq);
        let action = match &mut node.kind {
            TaskKind::Scheduled { action } | TaskKind::Request { action, .. } => action,
            _ => return,
        };
        if let Action::CallSubOrchestrator { instance_id: child, .. } = &mut *action {
            if child.is_empty() {
                *child = format!("{instance_id}:{seq:04X}");
            }
        }
        let action = action.clone();

        let Some(&pos) = self.records.get(self.next_record) else {
            let pending = PendingAction {
                sequence_number: seq,
                action,
            };
            self.issued.push(pending.clone());
            self.batch.push(BatchEntry { task: Some(id), pending });
            return;
        };

        let record = &self.history[pos];
        if !action.matches_record(&record.kind, self.strict_input_matching) {
            let message = format!(
                "nondeterministic: schedule order mismatch: next recorded event is {} (event_id={}) but the orchestration issued {}",
                describe_record(&record.kind),
                record.event_id,
                action.describe()
            );
            self.abort_with(ErrorDetails::nondeterminism(message));
            return;
        }
        self.next_record += 1;
        let record_id = record.event_id;

        // recorded sub-orchestration ids win over generated ones
        if let HistoryEventKind::SubOrchestrationInstanceCreated {
            instance_id: recorded, ..
        } = &record.kind
        {
            let recorded = recorded.clone();
            if let TaskKind::Scheduled {
                action: Action::CallSubOrchestrator { instance_id, .. },
            } = &mut self.tasks[id].kind
            {
                *instance_id = recorded;
            }
        }
        if let Some(action) = self.tasks[id].action() {
            let pending = PendingAction {
                sequence_number: seq,
                action: action.clone(),
            };
            self.issued.push(pending);
        }

        self.record_tasks.insert(record_id, id);
        if let Some(completion) = self.buffered_completions.remove(&record_id) {
            self.complete_from_event(id, completion);
        }
    }

    fn attach_waiter(&mut self, id: TaskId, name: String) {
        let buffered = self.buffered_events.get_mut(&name).and_then(VecDeque::pop_front);
        match buffered {
            Some(pos) => self.complete_from_event(id, pos),
            None => self.waiters.entry(name).or_default().push_back(id),
        }
    }

    // ---------------------------------------------------------------------
    // History cursor
    // ---------------------------------------------------------------------

    /// Apply the next history event. Returns `false` once history is exhausted.
    pub(crate) fn advance(&mut self) -> bool {
        let Some(event) = self.history.get(self.cursor) else {
            return false;
        };
        let pos = self.cursor;
        self.cursor += 1;

        match &event.kind {
            HistoryEventKind::OrchestratorStarted => self.current_time = event.timestamp,
            HistoryEventKind::EventRaised { name, .. } => {
                let name = name.clone();
                self.apply_raised(pos, name);
            }
            kind if kind.completes_record_kind().is_some() => self.apply_completion(pos),
            _ => {}
        }
        true
    }

    fn apply_completion(&mut self, pos: usize) {
        let event = &self.history[pos];
        let (Some(record_id), Some(expected)) = (event.correlation_id(), event.kind.completes_record_kind()) else {
            return;
        };
        let completion_name = event.kind_name();
        let event_id = event.event_id;
        let record = self
            .history
            .iter()
            .find(|e| e.event_id == record_id)
            .and_then(|e| e.kind.record_kind());

        match record {
            None => self.abort_with(ErrorDetails::nondeterminism(format!(
                "nondeterministic: no matching schedule for {completion_name} (event_id={event_id}) referencing id={record_id}"
            ))),
            Some(kind) if kind != expected => self.abort_with(ErrorDetails::nondeterminism(format!(
                "nondeterministic: completion kind mismatch for id={record_id}: recorded {kind:?}, got {completion_name}"
            ))),
            Some(_) => match self.record_tasks.get(&record_id) {
                Some(&task) => self.complete_from_event(task, pos),
                None if self.buffered_completions.contains_key(&record_id) => warn!(
                    target: "durable_replay::orchestration",
                    instance_id = %self.instance_id,
                    record_id,
                    event_id,
                    "ignoring duplicate completion"
                ),
                None => {
                    self.buffered_completions.insert(record_id, pos);
                }
            },
        }
    }

    fn apply_raised(&mut self, pos: usize, name: String) {
        let waiter = self.waiters.get_mut(&name).and_then(VecDeque::pop_front);
        match waiter {
            Some(task) => self.complete_from_event(task, pos),
            None => {
                debug!(
                    target: "durable_replay::orchestration",
                    instance_id = %self.instance_id,
                    event_name = %name,
                    "buffering event with no waiter"
                );
                self.buffered_events.entry(name).or_default().push_back(pos);
            }
        }
    }

    fn complete_from_event(&mut self, id: TaskId, pos: usize) {
        let node = &self.tasks[id];
        let event = &self.history[pos];
        if !node.is_pending() {
            warn!(
                target: "durable_replay::orchestration",
                instance_id = %self.instance_id,
                event_id = event.event_id,
                "ignoring completion for a task that already completed"
            );
            return;
        }
        if node.canceled {
            debug!(
                target: "durable_replay::orchestration",
                instance_id = %self.instance_id,
                event_id = event.event_id,
                "ignoring completion for a canceled timer"
            );
            return;
        }

        let outcome = match (&node.kind, &event.kind) {
            (_, HistoryEventKind::TaskCompleted { result, .. })
            | (_, HistoryEventKind::SubOrchestrationInstanceCompleted { result, .. }) => {
                Ok(result.clone().unwrap_or(Value::Null))
            }
            (_, HistoryEventKind::TaskFailed { reason, details, .. })
            | (_, HistoryEventKind::SubOrchestrationInstanceFailed { reason, details, .. }) => Err(Fault::Failed {
                reason: reason.clone(),
                details: details.clone(),
            }),
            (_, HistoryEventKind::TimerFired { .. }) => Ok(Value::Null),
            (
                TaskKind::Request {
                    response: ResponseKind::EntityResult,
                    ..
                },
                HistoryEventKind::EventRaised { input, .. },
            ) => decode_entity_response(input.as_ref()),
            (
                TaskKind::Request {
                    response: ResponseKind::LockGranted,
                    action: Action::AcquireLock {
                        critical_section_id,
                        lock_set,
                    },
                    ..
                },
                HistoryEventKind::EventRaised { .. },
            ) => {
                self.held_locks = Some((critical_section_id.clone(), lock_set.clone()));
                Ok(Value::Null)
            }
            (_, HistoryEventKind::EventRaised { input, .. }) => Ok(input.clone().unwrap_or(Value::Null)),
            _ => return,
        };
        let completion_index = event.event_id;
        self.resolve(id, outcome, completion_index);
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    fn set_outcome(&mut self, id: TaskId, outcome: Result<Value, Fault>, completion_index: Option<u64>) {
        let node = &mut self.tasks[id];
        node.state = match outcome {
            Ok(value) => TaskState::Completed(value),
            Err(fault) => TaskState::Faulted(fault),
        };
        node.completion_index = completion_index;
    }

    fn resolve(&mut self, id: TaskId, outcome: Result<Value, Fault>, completion_index: u64) {
        self.set_outcome(id, outcome, Some(completion_index));
        self.settle_ancestors(id);
    }

    fn settle_ancestors(&mut self, id: TaskId) {
        for parent in self.tasks[id].parents.clone() {
            if self.tasks[parent].is_pending() {
                self.settle(parent);
                if !self.tasks[parent].is_pending() {
                    self.settle_ancestors(parent);
                }
            }
        }
    }

    /// Re-evaluate a composite task from the state of its members.
    fn settle(&mut self, id: TaskId) {
        match &self.tasks[id].kind {
            TaskKind::Set { mode, members, .. } => {
                let (mode, members) = (*mode, members.clone());
                // nested sets are settled first so ties inside one event see every member
                for &m in &members {
                    if self.tasks[m].is_pending() && matches!(self.tasks[m].kind, TaskKind::Set { .. }) {
                        self.settle(m);
                    }
                }
                match mode {
                    SetMode::All => self.settle_all(id, &members),
                    SetMode::Any => self.settle_any(id, &members),
                }
            }
            TaskKind::Retry(_) => self.settle_retry(id),
            _ => {}
        }
    }

    fn settle_all(&mut self, id: TaskId, members: &[TaskId]) {
        if members.iter().any(|&m| self.tasks[m].is_pending()) {
            return;
        }
        let completion_index = members.iter().filter_map(|&m| self.tasks[m].completion_index).max();
        let faults: Vec<Fault> = members
            .iter()
            .filter_map(|&m| match &self.tasks[m].state {
                TaskState::Faulted(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        let outcome = if faults.is_empty() {
            Ok(Value::Array(
                members
                    .iter()
                    .map(|&m| match &self.tasks[m].state {
                        TaskState::Completed(v) => v.clone(),
                        _ => Value::Null,
                    })
                    .collect(),
            ))
        } else {
            Err(Fault::Aggregate { faults })
        };
        self.set_outcome(id, outcome, completion_index);
    }

    fn settle_any(&mut self, id: TaskId, members: &[TaskId]) {
        let winner = members
            .iter()
            .enumerate()
            .filter(|&(_, &m)| !self.tasks[m].is_pending())
            .min_by_key(|&(position, &m)| {
                (
                    self.tasks[m].completion_index.unwrap_or(0),
                    self.issuance_order(m),
                    position,
                )
            })
            .map(|(_, &m)| m);
        let Some(winner) = winner else {
            return;
        };
        let outcome = match &self.tasks[winner].state {
            TaskState::Completed(v) => Ok(v.clone()),
            TaskState::Faulted(f) => Err(f.clone()),
            TaskState::Pending => return,
        };
        let completion_index = self.tasks[winner].completion_index;
        if let TaskKind::Set { winner: slot, .. } = &mut self.tasks[id].kind {
            *slot = Some(winner);
        }
        self.set_outcome(id, outcome, completion_index);
    }

    fn issuance_order(&self, id: TaskId) -> u32 {
        let node = &self.tasks[id];
        node.sequence_number.unwrap_or_else(|| match &node.kind {
            TaskKind::Set { members, .. } => members
                .iter()
                .map(|&m| self.issuance_order(m))
                .min()
                .unwrap_or(u32::MAX),
            _ => u32::MAX,
        })
    }

    // ---------------------------------------------------------------------
    // Retries
    // ---------------------------------------------------------------------

    fn start_attempt(&mut self, id: TaskId) {
        let TaskKind::Retry(retry) = &mut self.tasks[id].kind else {
            return;
        };
        retry.attempt += 1;
        let action = retry.template.clone();
        let attempt = self.add_task(TaskKind::Scheduled { action });
        self.tasks[attempt].parents.push(id);
        if let TaskKind::Retry(retry) = &mut self.tasks[id].kind {
            retry.phase = Some(RetryPhase::Attempt(attempt));
        }
        self.yield_task(attempt);
        if self.tasks[id].sequence_number.is_none() {
            self.tasks[id].sequence_number = self.tasks[attempt].sequence_number;
        }
    }

    fn settle_retry(&mut self, id: TaskId) {
        let TaskKind::Retry(retry) = &self.tasks[id].kind else {
            return;
        };
        match retry.phase {
            Some(RetryPhase::Attempt(attempt)) => {
                let completion_index = self.tasks[attempt].completion_index;
                match self.tasks[attempt].state.clone() {
                    TaskState::Pending => {}
                    TaskState::Completed(value) => self.set_outcome(id, Ok(value), completion_index),
                    TaskState::Faulted(fault) => {
                        let exhausted = retry.attempt >= retry.options.max_number_of_attempts;
                        let timed_out = retry
                            .options
                            .retry_timeout_ms
                            .is_some_and(|ms| self.current_time >= offset(retry.started_at, Duration::from_millis(ms)));
                        if exhausted || timed_out {
                            debug!(
                                target: "durable_replay::orchestration",
                                instance_id = %self.instance_id,
                                attempt = retry.attempt,
                                exhausted,
                                timed_out,
                                "giving up on retried call"
                            );
                            self.set_outcome(id, Err(fault), completion_index);
                            return;
                        }
                        let fire_at = offset(self.current_time, retry.options.delay_for_attempt(retry.attempt));
                        let timer = self.add_task(TaskKind::Scheduled {
                            action: Action::create_timer(fire_at),
                        });
                        self.tasks[timer].parents.push(id);
                        if let TaskKind::Retry(retry) = &mut self.tasks[id].kind {
                            retry.phase = Some(RetryPhase::Backoff(timer));
                        }
                        self.yield_task(timer);
                    }
                }
            }
            Some(RetryPhase::Backoff(timer)) => {
                if !self.tasks[timer].is_pending() {
                    self.start_attempt(id);
                }
            }
            None => {}
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn cancel_timer(&mut self, id: TaskId) {
        if self.tasks[id].canceled {
            return;
        }
        if !self.tasks[id].is_pending() {
            self.abort_with(ErrorDetails::invalid_operation(
                "timer",
                "cannot cancel a timer that has already fired",
            ));
            return;
        }
        self.yield_task(id);
        if self.abort.is_some() {
            return;
        }
        let node = &mut self.tasks[id];
        node.canceled = true;
        let (Some(seq), Some(Action::CreateTimer { fire_at, .. })) = (node.sequence_number, node.action().cloned())
        else {
            return;
        };
        match self.batch.iter_mut().find(|e| e.task == Some(id)) {
            Some(entry) => {
                if let Action::CreateTimer { is_canceled, .. } = &mut entry.pending.action {
                    *is_canceled = true;
                }
            }
            None => self.batch.push(BatchEntry {
                task: Some(id),
                pending: PendingAction {
                    sequence_number: seq,
                    action: Action::CreateTimer {
                        fire_at,
                        is_canceled: true,
                    },
                },
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Completion of the run
    // ---------------------------------------------------------------------

    pub(crate) fn should_stop(&self) -> bool {
        self.abort.is_some() || self.continue_as_new.is_some()
    }

    pub(crate) fn summarize(&mut self) -> RunSummary {
        let mut entries = std::mem::take(&mut self.batch);
        // an external event received during this run needs no wait action
        entries.retain(|e| match e.task {
            Some(id) => !(matches!(self.tasks[id].kind, TaskKind::External { .. }) && !self.tasks[id].is_pending()),
            None => true,
        });
        entries.sort_by_key(|e| e.pending.sequence_number);

        let unclaimed_record = self.records.get(self.next_record).map(|&pos| {
            let record = &self.history[pos];
            format!(
                "nondeterministic: history contains {} scheduled action(s) the orchestration did not issue; first is {} (event_id={})",
                self.records.len() - self.next_record,
                describe_record(&record.kind),
                record.event_id
            )
        });
        let outstanding_timers = self
            .tasks
            .iter()
            .filter(|t| t.is_timer() && t.yielded && t.is_pending() && !t.canceled)
            .count();

        RunSummary {
            actions: entries.into_iter().map(|e| e.pending).collect(),
            custom_status: self.custom_status.take(),
            continue_as_new: self.continue_as_new.take(),
            abort: self.abort.take(),
            unclaimed_record,
            outstanding_timers,
        }
    }
}

fn describe_record(kind: &HistoryEventKind) -> String {
    match kind {
        HistoryEventKind::TaskScheduled { name, .. } => format!("TaskScheduled('{name}')"),
        HistoryEventKind::SubOrchestrationInstanceCreated { name, .. } => {
            format!("SubOrchestrationInstanceCreated('{name}')")
        }
        HistoryEventKind::EventSent { instance_id, name, .. } => format!("EventSent('{instance_id}', '{name}')"),
        other => other.name().to_string(),
    }
}

fn decode_entity_response(input: Option<&Value>) -> Result<Value, Fault> {
    let Some(input) = input else {
        return Ok(Value::Null);
    };
    let response: ResponseMessage = serde_json::from_value(input.clone())?;
    if response.exception_type.is_some() {
        return Err(Fault::Entity {
            exception_type: response.exception_type,
            message: response.result.unwrap_or_default(),
        });
    }
    Ok(match response.result {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        _ => Value::Null,
    })
}

fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn encode(input: impl Serialize) -> Result<Option<Value>, ValidationError> {
    let value = serde_json::to_value(input).map_err(|e| ValidationError::Payload(e.to_string()))?;
    Ok((!value.is_null()).then_some(value))
}

/// Handle orchestration code uses to issue work and read deterministic values.
///
/// Cheap to clone; every clone refers to the same run.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance_id: String,
        parent_instance_id: Option<String>,
        history: Vec<HistoryEvent>,
        options: &ReplayOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                instance_id,
                parent_instance_id,
                history,
                options,
            ))),
        }
    }

    pub(crate) fn guard(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self, id: TaskId) -> Task {
        Task {
            id,
            ctx: self.clone(),
        }
    }

    fn new_task(&self, kind: Result<TaskKind, ValidationError>) -> Task {
        let mut inner = self.guard();
        let id = match kind {
            Ok(kind) => inner.add_task(kind),
            Err(e) => inner.invalid(e),
        };
        drop(inner);
        self.task(id)
    }

    pub fn instance_id(&self) -> String {
        self.guard().instance_id.clone()
    }

    pub fn parent_instance_id(&self) -> Option<String> {
        self.guard().parent_instance_id.clone()
    }

    /// Deterministic "now": the timestamp of the latest `OrchestratorStarted` event reached so far.
    pub fn current_utc_date_time(&self) -> DateTime<Utc> {
        self.guard().current_time
    }

    /// True while the code runs against events an earlier invocation already observed.
    pub fn is_replaying(&self) -> bool {
        self.guard().is_replaying()
    }

    /// Replay-stable v5 UUID derived from the instance id, the clock and a per-run counter.
    pub fn new_guid(&self) -> Uuid {
        self.guard().new_guid()
    }

    pub fn call_activity(&self, name: impl Into<String>, input: impl Serialize) -> Task {
        let kind = encode(input)
            .and_then(|input| Action::call_activity(name, input))
            .map(|action| TaskKind::Scheduled { action });
        self.new_task(kind)
    }

    /// Call an activity, re-issuing it after a backoff timer while it keeps failing.
    pub fn call_activity_with_retry(&self, name: impl Into<String>, options: RetryOptions, input: impl Serialize) -> Task {
        let now = self.current_utc_date_time();
        let kind = encode(input)
            .and_then(|input| Action::call_activity_with_retry(name, options.clone(), input))
            .map(|template| retry_kind(template, options, now));
        self.new_task(kind)
    }

    /// Start a sub-orchestration under the generated instance id `"{parent}:{seq:04X}"`.
    pub fn call_sub_orchestrator(&self, name: impl Into<String>, input: impl Serialize) -> Task {
        self.sub_orchestrator(name, None, input, None)
    }

    pub fn call_sub_orchestrator_with_instance_id(
        &self,
        name: impl Into<String>,
        instance_id: impl Into<String>,
        input: impl Serialize,
    ) -> Task {
        self.sub_orchestrator(name, Some(instance_id.into()), input, None)
    }

    pub fn call_sub_orchestrator_with_retry(
        &self,
        name: impl Into<String>,
        options: RetryOptions,
        instance_id: Option<String>,
        input: impl Serialize,
    ) -> Task {
        self.sub_orchestrator(name, instance_id, input, Some(options))
    }

    fn sub_orchestrator(
        &self,
        name: impl Into<String>,
        instance_id: Option<String>,
        input: impl Serialize,
        options: Option<RetryOptions>,
    ) -> Task {
        let now = self.current_utc_date_time();
        let generated = instance_id.is_none();
        let kind = encode(input).and_then(|input| {
            // the placeholder id is validated here and replaced once a sequence number is known
            let mut action = Action::call_sub_orchestrator(
                name,
                instance_id.unwrap_or_else(|| "generated".to_string()),
                input,
                options.clone(),
            )?;
            if let Action::CallSubOrchestrator { instance_id, .. } = &mut action {
                if generated {
                    instance_id.clear();
                }
            }
            Ok(match options {
                Some(options) => retry_kind(action, options, now),
                None => TaskKind::Scheduled { action },
            })
        });
        self.new_task(kind)
    }

    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> TimerTask {
        TimerTask {
            task: self.new_task(Ok(TaskKind::Scheduled {
                action: Action::create_timer(fire_at),
            })),
        }
    }

    /// Timer relative to the deterministic clock.
    pub fn create_timer_after(&self, delay: Duration) -> TimerTask {
        let fire_at = offset(self.current_utc_date_time(), delay);
        self.create_timer(fire_at)
    }

    /// Wait for an event raised on this instance. Events raised before anyone waited are kept, oldest first.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> Task {
        let name = name.into();
        let kind = Action::wait_for_external_event(name.clone()).map(|_| TaskKind::External { name });
        self.new_task(kind)
    }

    /// Two-way entity operation; resolves with the operation's return value.
    pub fn call_entity(&self, entity_id: EntityId, operation: impl Into<String>, input: impl Serialize) -> Task {
        let mut inner = self.guard();
        let outside_lock_set = inner
            .held_locks
            .as_ref()
            .is_some_and(|(_, held)| !held.contains(&entity_id));
        if outside_lock_set {
            let id = inner.invalid(ValidationError::Lock(format!(
                "cannot call {entity_id} from a critical section that does not hold its lock"
            )));
            drop(inner);
            return self.task(id);
        }
        let request_id = inner.new_guid().to_string();
        let kind = encode(input)
            .and_then(|input| Action::call_entity(entity_id, operation, input, request_id.clone()))
            .map(|action| TaskKind::Request {
                action,
                response_name: request_id,
                response: ResponseKind::EntityResult,
            });
        let id = match kind {
            Ok(kind) => inner.add_task(kind),
            Err(e) => inner.invalid(e),
        };
        drop(inner);
        self.task(id)
    }

    /// One-way entity operation, scheduled immediately.
    pub fn signal_entity(&self, entity_id: EntityId, operation: impl Into<String>, input: impl Serialize) {
        let mut inner = self.guard();
        let request_id = inner.new_guid().to_string();
        let action = encode(input).and_then(|input| Action::signal_entity(entity_id, operation, input, request_id));
        match action {
            Ok(action) => {
                let id = inner.add_task(TaskKind::Scheduled { action });
                inner.yield_task(id);
            }
            Err(e) => {
                inner.invalid(e);
            }
        }
    }

    /// Acquire locks on every entity in `entities`, entered in a stable order.
    ///
    /// Resolves once all locks are held. Nested critical sections are rejected.
    pub fn lock(&self, entities: Vec<EntityId>) -> Task {
        let mut inner = self.guard();
        if inner.held_locks.is_some() {
            let id = inner.invalid(ValidationError::Lock(
                "cannot acquire locks while already holding locks".to_string(),
            ));
            drop(inner);
            return self.task(id);
        }
        let critical_section_id = inner.new_guid().to_string();
        let kind = Action::acquire_lock(critical_section_id.clone(), entities).map(|action| TaskKind::Request {
            action,
            response_name: critical_section_id,
            response: ResponseKind::LockGranted,
        });
        let id = match kind {
            Ok(kind) => inner.add_task(kind),
            Err(e) => inner.invalid(e),
        };
        drop(inner);
        self.task(id)
    }

    pub fn is_locked(&self) -> bool {
        self.guard().held_locks.is_some()
    }

    pub fn locked_entities(&self) -> Vec<EntityId> {
        self.guard()
            .held_locks
            .as_ref()
            .map(|(_, held)| held.clone())
            .unwrap_or_default()
    }

    /// Leave the current critical section. Does nothing when no locks are held.
    pub fn release_locks(&self) {
        let mut inner = self.guard();
        let Some((critical_section_id, lock_set)) = inner.held_locks.take() else {
            return;
        };
        let id = inner.add_task(TaskKind::Scheduled {
            action: Action::ReleaseLock {
                critical_section_id,
                lock_set,
            },
        });
        inner.yield_task(id);
    }

    /// Durable HTTP call executed by the host; resolves with a [`DurableHttpResponse`](crate::actions::DurableHttpResponse).
    pub fn call_http(&self, request: DurableHttpRequest) -> Task {
        let kind = Action::call_http(request).map(|action| TaskKind::Scheduled { action });
        self.new_task(kind)
    }

    /// Completes when every task completed. Results come back as an array in input order;
    /// if any member faulted the set faults with every member fault.
    pub fn task_all<T: Into<Task>>(&self, tasks: impl IntoIterator<Item = T>) -> TaskSet {
        self.task_set(SetMode::All, tasks)
    }

    /// Completes with the first member to complete.
    ///
    /// Members completed by the same history event are ordered by issuance, then by position.
    pub fn task_any<T: Into<Task>>(&self, tasks: impl IntoIterator<Item = T>) -> TaskSet {
        self.task_set(SetMode::Any, tasks)
    }

    fn task_set<T: Into<Task>>(&self, mode: SetMode, tasks: impl IntoIterator<Item = T>) -> TaskSet {
        let members: Vec<TaskId> = tasks.into_iter().map(|t| Into::<Task>::into(t).id).collect();
        let mut inner = self.guard();
        let id = if mode == SetMode::Any && members.is_empty() {
            inner.invalid(ValidationError::Empty {
                what: "task_any member list",
            })
        } else {
            let id = inner.add_task(TaskKind::Set {
                mode,
                members: members.clone(),
                winner: None,
            });
            for &m in &members {
                inner.tasks[m].parents.push(id);
            }
            inner.settle(id);
            id
        };
        drop(inner);
        TaskSet { task: self.task(id) }
    }

    /// Custom status reported with the run's outcome.
    pub fn set_custom_status(&self, status: impl Serialize) {
        let mut inner = self.guard();
        match encode(status) {
            Ok(status) => inner.custom_status = status,
            Err(e) => inner.abort_with(e.into()),
        }
    }

    /// Restart with a fresh history and `input` once the current run suspends or returns.
    pub fn continue_as_new(&self, input: impl Serialize) {
        self.request_continue_as_new(input, false);
    }

    /// Like [`continue_as_new`](Self::continue_as_new), carrying unprocessed external events into the new execution.
    pub fn continue_as_new_preserving_events(&self, input: impl Serialize) {
        self.request_continue_as_new(input, true);
    }

    fn request_continue_as_new(&self, input: impl Serialize, preserve_unprocessed_events: bool) {
        let mut inner = self.guard();
        let input = match encode(input) {
            Ok(input) => input,
            Err(e) => {
                inner.abort_with(e.into());
                return;
            }
        };
        let sequence_number = inner.next_sequence_number();
        inner.continue_as_new = Some((
            input.clone(),
            PendingAction {
                sequence_number,
                action: Action::continue_as_new(input, preserve_unprocessed_events),
            },
        ));
    }

    // ---------------------------------------------------------------------
    // Task plumbing used by crate::futures
    // ---------------------------------------------------------------------

    pub(crate) fn poll_task(&self, id: TaskId) -> Poll<Result<Value, Fault>> {
        let mut inner = self.guard();
        inner.yield_task(id);
        if inner.abort.is_some() {
            return Poll::Pending;
        }
        match &inner.tasks[id].state {
            TaskState::Pending => Poll::Pending,
            TaskState::Completed(v) => Poll::Ready(Ok(v.clone())),
            TaskState::Faulted(f) => Poll::Ready(Err(f.clone())),
        }
    }

    pub(crate) fn poll_winner(&self, id: TaskId) -> Poll<Task> {
        let mut inner = self.guard();
        inner.yield_task(id);
        if inner.abort.is_some() || inner.tasks[id].is_pending() {
            return Poll::Pending;
        }
        let winner = match &inner.tasks[id].kind {
            TaskKind::Set {
                winner: Some(winner), ..
            } => *winner,
            _ => id,
        };
        drop(inner);
        Poll::Ready(self.task(winner))
    }

    pub(crate) fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&TaskNode) -> R) -> R {
        f(&self.guard().tasks[id])
    }

    pub(crate) fn take_new_actions(&self, id: TaskId) -> Vec<PendingAction> {
        let mut inner = self.guard();
        inner.yield_task(id);
        std::mem::take(&mut inner.tasks[id].new_actions)
    }

    pub(crate) fn cancel_timer(&self, id: TaskId) {
        self.guard().cancel_timer(id);
    }
}

fn retry_kind(template: Action, options: RetryOptions, now: DateTime<Utc>) -> TaskKind {
    TaskKind::Retry(RetryState {
        template,
        options,
        attempt: 0,
        phase: None,
        started_at: now,
    })
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.guard();
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &inner.instance_id)
            .field("cursor", &inner.cursor)
            .field("tasks", &inner.tasks.len())
            .finish()
    }
}
