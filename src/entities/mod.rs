//! Durable entities: small stateful actors whose queued operations are applied
//! one batch at a time.
//!
//! The dispatch loop runs plain functions to completion; it has no await points
//! and is never replayed. Everything it wants done elsewhere (responses, signals
//! to other entities, lock hand-offs) is returned to the host in the batch result.

mod dispatch;
mod registry;

pub use dispatch::{EntityContext, EntityDispatcher};
pub use registry::{EntityRegistry, EntityRegistryBuilder, OperationHandler};

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies one entity instance. Names are case-insensitive and stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityId {
    name: String,
    key: String,
}

impl EntityId {
    pub fn new(name: impl AsRef<str>, key: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.as_ref().trim().to_lowercase();
        let key = key.into();
        if name.is_empty() || name.contains('@') {
            return Err(ValidationError::EntityId(format!("@{name}@{key}")));
        }
        if key.is_empty() {
            return Err(ValidationError::EntityId(format!("@{name}@")));
        }
        Ok(Self { name, key })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Instance id the host uses for the entity's scheduler: `@name@key`.
    pub fn scheduler_id(&self) -> String {
        format!("@{}@{}", self.name, self.key)
    }

    pub fn parse_scheduler_id(id: &str) -> Result<Self, ValidationError> {
        let (name, key) = id
            .strip_prefix('@')
            .and_then(|rest| rest.split_once('@'))
            .ok_or_else(|| ValidationError::EntityId(id.to_string()))?;
        Self::new(name, key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}@{}", self.name, self.key)
    }
}

/// A queued message for an entity.
///
/// Operation calls and signals carry `op`; lock requests carry only the lock
/// set and the position of the receiving entity within it; release messages set `release`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: String,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub signal: bool,
    #[serde(default)]
    pub input: Option<Value>,
    /// Instance id of the sender.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub lock_set: Vec<EntityId>,
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub release: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Call,
    Signal,
    Lock,
    Release,
}

impl RequestMessage {
    pub fn operation(id: impl Into<String>, op: impl Into<String>, input: Option<Value>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            op: Some(op.into()),
            signal: false,
            input,
            parent,
            lock_set: Vec::new(),
            position: 0,
            release: false,
        }
    }

    pub fn signal(id: impl Into<String>, op: impl Into<String>, input: Option<Value>, parent: Option<String>) -> Self {
        Self {
            signal: true,
            ..Self::operation(id, op, input, parent)
        }
    }

    pub fn lock(critical_section_id: impl Into<String>, parent: impl Into<String>, lock_set: Vec<EntityId>) -> Self {
        Self {
            id: critical_section_id.into(),
            op: None,
            signal: false,
            input: None,
            parent: Some(parent.into()),
            lock_set,
            position: 0,
            release: false,
        }
    }

    pub fn release(critical_section_id: impl Into<String>, parent: impl Into<String>, lock_set: Vec<EntityId>) -> Self {
        Self {
            release: true,
            ..Self::lock(critical_section_id, parent, lock_set)
        }
    }

    pub(crate) fn kind(&self) -> Option<RequestKind> {
        match (&self.op, self.release, self.lock_set.is_empty()) {
            (_, true, _) => Some(RequestKind::Release),
            (Some(_), false, _) if self.signal => Some(RequestKind::Signal),
            (Some(_), false, _) => Some(RequestKind::Call),
            (None, false, false) => Some(RequestKind::Lock),
            (None, false, true) => None,
        }
    }

    /// The same message addressed to the next entity of its lock set, if any.
    pub(crate) fn forward(&self) -> Option<(EntityId, RequestMessage)> {
        let next = self.lock_set.get(self.position + 1)?.clone();
        let mut message = self.clone();
        message.position += 1;
        Some((next, message))
    }
}

/// The response an orchestration receives as the payload of an `EventRaised`
/// named after the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    /// Serialized JSON of the operation's return value, or the error message.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
}

/// Durable record of one entity, owned by the host between batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    #[serde(default)]
    pub exists: bool,
    /// Serialized JSON of the entity state.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub queue: Vec<RequestMessage>,
    /// Instance id of the orchestration currently holding the entity's lock.
    #[serde(default)]
    pub locked_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub request_id: String,
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    pub duration_ms: u64,
}

impl OperationResult {
    /// The message the host delivers back to the caller.
    pub fn response(&self) -> ResponseMessage {
        ResponseMessage {
            result: self.result.clone(),
            exception_type: self.is_error.then(|| "EntityOperationFailed".to_string()),
        }
    }
}

/// A message an entity batch wants delivered to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingSignal {
    pub target: EntityId,
    pub message: RequestMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBatchRequest {
    pub entity_id: EntityId,
    #[serde(default)]
    pub state: SchedulerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBatchResult {
    /// The snapshot the host persists; `queue` holds requests deferred by a lock.
    pub scheduler_state: SchedulerState,
    /// One entry per executed call or granted lock, in execution order.
    pub results: Vec<OperationResult>,
    pub signals: Vec<OutgoingSignal>,
}

impl EntityBatchResult {
    pub fn entity_exists(&self) -> bool {
        self.scheduler_state.exists
    }

    pub fn entity_state(&self) -> Option<&str> {
        self.scheduler_state.state.as_deref()
    }
}
