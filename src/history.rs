//! Append-only orchestration history supplied by the host on every invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable record of something that already happened.
///
/// `event_id` is the event's index within the log. It never changes across
/// invocations and doubles as the completion index of whatever task it resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Set by the host on events that an earlier invocation already observed.
    #[serde(default)]
    pub is_played: bool,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum HistoryEventKind {
    OrchestratorStarted,
    OrchestratorCompleted,
    ExecutionStarted {
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    ExecutionCompleted {
        #[serde(default)]
        result: Option<Value>,
    },
    ExecutionTerminated {
        #[serde(default)]
        reason: Option<String>,
    },
    TaskScheduled {
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    TaskCompleted {
        task_scheduled_id: u64,
        #[serde(default)]
        result: Option<Value>,
    },
    TaskFailed {
        task_scheduled_id: u64,
        reason: String,
        #[serde(default)]
        details: Option<String>,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: u64,
        fire_at: DateTime<Utc>,
    },
    SubOrchestrationInstanceCreated {
        name: String,
        instance_id: String,
        #[serde(default)]
        input: Option<Value>,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: u64,
        #[serde(default)]
        result: Option<Value>,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: u64,
        reason: String,
        #[serde(default)]
        details: Option<String>,
    },
    /// A message sent to another instance; entity requests, signals and lock messages.
    EventSent {
        instance_id: String,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    EventRaised {
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    ContinueAsNew {
        #[serde(default)]
        input: Option<Value>,
    },
}

/// The record kind an action turns into once the host has scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Task,
    Timer,
    SubOrchestration,
    EventSent,
}

impl HistoryEvent {
    pub fn new(event_id: u64, timestamp: DateTime<Utc>, kind: HistoryEventKind) -> Self {
        Self {
            event_id,
            timestamp,
            is_played: false,
            kind,
        }
    }

    /// Mark this event as already observed by a previous invocation.
    pub fn played(mut self) -> Self {
        self.is_played = true;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether this event records that the host accepted a scheduling action.
    pub fn is_scheduling_record(&self) -> bool {
        self.kind.record_kind().is_some()
    }

    /// The `event_id` of the scheduling record a completion event answers.
    pub fn correlation_id(&self) -> Option<u64> {
        match &self.kind {
            HistoryEventKind::TaskCompleted { task_scheduled_id, .. }
            | HistoryEventKind::TaskFailed { task_scheduled_id, .. }
            | HistoryEventKind::SubOrchestrationInstanceCompleted { task_scheduled_id, .. }
            | HistoryEventKind::SubOrchestrationInstanceFailed { task_scheduled_id, .. } => Some(*task_scheduled_id),
            HistoryEventKind::TimerFired { timer_id, .. } => Some(*timer_id),
            _ => None,
        }
    }
}

impl HistoryEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            HistoryEventKind::OrchestratorStarted => "OrchestratorStarted",
            HistoryEventKind::OrchestratorCompleted => "OrchestratorCompleted",
            HistoryEventKind::ExecutionStarted { .. } => "ExecutionStarted",
            HistoryEventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            HistoryEventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            HistoryEventKind::TaskScheduled { .. } => "TaskScheduled",
            HistoryEventKind::TaskCompleted { .. } => "TaskCompleted",
            HistoryEventKind::TaskFailed { .. } => "TaskFailed",
            HistoryEventKind::TimerCreated { .. } => "TimerCreated",
            HistoryEventKind::TimerFired { .. } => "TimerFired",
            HistoryEventKind::SubOrchestrationInstanceCreated { .. } => "SubOrchestrationInstanceCreated",
            HistoryEventKind::SubOrchestrationInstanceCompleted { .. } => "SubOrchestrationInstanceCompleted",
            HistoryEventKind::SubOrchestrationInstanceFailed { .. } => "SubOrchestrationInstanceFailed",
            HistoryEventKind::EventSent { .. } => "EventSent",
            HistoryEventKind::EventRaised { .. } => "EventRaised",
            HistoryEventKind::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }

    pub(crate) fn record_kind(&self) -> Option<RecordKind> {
        match self {
            HistoryEventKind::TaskScheduled { .. } => Some(RecordKind::Task),
            HistoryEventKind::TimerCreated { .. } => Some(RecordKind::Timer),
            HistoryEventKind::SubOrchestrationInstanceCreated { .. } => Some(RecordKind::SubOrchestration),
            HistoryEventKind::EventSent { .. } => Some(RecordKind::EventSent),
            _ => None,
        }
    }

    /// The record kind a completion event must be correlated with.
    pub(crate) fn completes_record_kind(&self) -> Option<RecordKind> {
        match self {
            HistoryEventKind::TaskCompleted { .. } | HistoryEventKind::TaskFailed { .. } => Some(RecordKind::Task),
            HistoryEventKind::TimerFired { .. } => Some(RecordKind::Timer),
            HistoryEventKind::SubOrchestrationInstanceCompleted { .. }
            | HistoryEventKind::SubOrchestrationInstanceFailed { .. } => Some(RecordKind::SubOrchestration),
            _ => None,
        }
    }
}

/// Events belonging to the current execution: everything after the last `ContinueAsNew` record.
pub(crate) fn current_execution(history: Vec<HistoryEvent>) -> Vec<HistoryEvent> {
    match history
        .iter()
        .rposition(|e| matches!(e.kind, HistoryEventKind::ContinueAsNew { .. }))
    {
        Some(pos) => history.into_iter().skip(pos + 1).collect(),
        None => history,
    }
}
