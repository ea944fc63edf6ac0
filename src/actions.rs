//! The closed vocabulary of requests an orchestration may hand to the host.
//!
//! Actions are immutable once built and validated at construction time. The
//! engine wraps every issued action in a [`PendingAction`] carrying its
//! sequence number, which is what the host uses to correlate later results.

use crate::entities::EntityId;
use crate::errors::ValidationError;
use crate::history::{HistoryEventKind, RecordKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Activity name the host maps durable HTTP calls onto.
pub const HTTP_ACTIVITY_NAME: &str = "BuiltIn::HttpActivity";

/// EventSent name for entity operation and lock requests.
pub(crate) const ENTITY_REQUEST_EVENT: &str = "op";
/// EventSent name for lock release messages.
pub(crate) const ENTITY_RELEASE_EVENT: &str = "release";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all_fields = "camelCase")]
pub enum Action {
    CallActivity {
        function_name: String,
        input: Option<Value>,
        retry_options: Option<RetryOptions>,
    },
    CallSubOrchestrator {
        function_name: String,
        instance_id: String,
        input: Option<Value>,
        retry_options: Option<RetryOptions>,
    },
    CreateTimer {
        fire_at: DateTime<Utc>,
        is_canceled: bool,
    },
    WaitForExternalEvent {
        external_event_name: String,
    },
    CallEntity {
        entity_id: EntityId,
        operation: String,
        input: Option<Value>,
        request_id: String,
    },
    SignalEntity {
        entity_id: EntityId,
        operation: String,
        input: Option<Value>,
        request_id: String,
    },
    AcquireLock {
        critical_section_id: String,
        lock_set: Vec<EntityId>,
    },
    ReleaseLock {
        critical_section_id: String,
        lock_set: Vec<EntityId>,
    },
    CallHttp {
        http_request: DurableHttpRequest,
    },
    ContinueAsNew {
        input: Option<Value>,
        preserve_unprocessed_events: bool,
    },
}

/// An action together with its issuance order in the current execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub sequence_number: u32,
    pub action: Action,
}

fn require_name(value: &str, what: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { what });
    }
    Ok(())
}

impl Action {
    pub fn call_activity(name: impl Into<String>, input: Option<Value>) -> Result<Self, ValidationError> {
        let function_name = name.into();
        require_name(&function_name, "activity name")?;
        Ok(Action::CallActivity {
            function_name,
            input,
            retry_options: None,
        })
    }

    pub fn call_activity_with_retry(
        name: impl Into<String>,
        retry_options: RetryOptions,
        input: Option<Value>,
    ) -> Result<Self, ValidationError> {
        let function_name = name.into();
        require_name(&function_name, "activity name")?;
        retry_options.validate()?;
        Ok(Action::CallActivity {
            function_name,
            input,
            retry_options: Some(retry_options),
        })
    }

    pub fn call_sub_orchestrator(
        name: impl Into<String>,
        instance_id: impl Into<String>,
        input: Option<Value>,
        retry_options: Option<RetryOptions>,
    ) -> Result<Self, ValidationError> {
        let function_name = name.into();
        let instance_id = instance_id.into();
        require_name(&function_name, "sub-orchestrator name")?;
        require_name(&instance_id, "sub-orchestrator instance id")?;
        if let Some(opts) = &retry_options {
            opts.validate()?;
        }
        Ok(Action::CallSubOrchestrator {
            function_name,
            instance_id,
            input,
            retry_options,
        })
    }

    pub fn create_timer(fire_at: DateTime<Utc>) -> Self {
        Action::CreateTimer {
            fire_at,
            is_canceled: false,
        }
    }

    pub fn wait_for_external_event(name: impl Into<String>) -> Result<Self, ValidationError> {
        let external_event_name = name.into();
        require_name(&external_event_name, "external event name")?;
        Ok(Action::WaitForExternalEvent { external_event_name })
    }

    pub fn call_entity(
        entity_id: EntityId,
        operation: impl Into<String>,
        input: Option<Value>,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let operation = operation.into();
        require_name(&operation, "entity operation name")?;
        Ok(Action::CallEntity {
            entity_id,
            operation,
            input,
            request_id: request_id.into(),
        })
    }

    pub fn signal_entity(
        entity_id: EntityId,
        operation: impl Into<String>,
        input: Option<Value>,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let operation = operation.into();
        require_name(&operation, "entity operation name")?;
        Ok(Action::SignalEntity {
            entity_id,
            operation,
            input,
            request_id: request_id.into(),
        })
    }

    /// Locks are always requested in scheduler-id order so two orchestrations
    /// locking overlapping sets cannot deadlock each other.
    pub fn acquire_lock(
        critical_section_id: impl Into<String>,
        entities: Vec<EntityId>,
    ) -> Result<Self, ValidationError> {
        let lock_set = normalize_lock_set(entities)?;
        Ok(Action::AcquireLock {
            critical_section_id: critical_section_id.into(),
            lock_set,
        })
    }

    pub fn call_http(request: DurableHttpRequest) -> Result<Self, ValidationError> {
        request.validate()?;
        Ok(Action::CallHttp { http_request: request })
    }

    pub fn continue_as_new(input: Option<Value>, preserve_unprocessed_events: bool) -> Self {
        Action::ContinueAsNew {
            input,
            preserve_unprocessed_events,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::CallActivity { .. } => "CallActivity",
            Action::CallSubOrchestrator { .. } => "CallSubOrchestrator",
            Action::CreateTimer { .. } => "CreateTimer",
            Action::WaitForExternalEvent { .. } => "WaitForExternalEvent",
            Action::CallEntity { .. } => "CallEntity",
            Action::SignalEntity { .. } => "SignalEntity",
            Action::AcquireLock { .. } => "AcquireLock",
            Action::ReleaseLock { .. } => "ReleaseLock",
            Action::CallHttp { .. } => "CallHttp",
            Action::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }

    pub fn retry_options(&self) -> Option<&RetryOptions> {
        match self {
            Action::CallActivity { retry_options, .. } | Action::CallSubOrchestrator { retry_options, .. } => {
                retry_options.as_ref()
            }
            _ => None,
        }
    }

    /// Short human-readable description used in nondeterminism messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Action::CallActivity { function_name, .. } => format!("CallActivity('{function_name}')"),
            Action::CallSubOrchestrator { function_name, .. } => format!("CallSubOrchestrator('{function_name}')"),
            Action::CreateTimer { .. } => "CreateTimer".to_string(),
            Action::WaitForExternalEvent { external_event_name } => {
                format!("WaitForExternalEvent('{external_event_name}')")
            }
            Action::CallEntity {
                entity_id, operation, ..
            } => format!("CallEntity('{entity_id}', '{operation}')"),
            Action::SignalEntity {
                entity_id, operation, ..
            } => format!("SignalEntity('{entity_id}', '{operation}')"),
            Action::AcquireLock { lock_set, .. } => format!("AcquireLock({} entities)", lock_set.len()),
            Action::ReleaseLock { lock_set, .. } => format!("ReleaseLock({} entities)", lock_set.len()),
            Action::CallHttp { http_request } => format!("CallHttp({} {})", http_request.method, http_request.uri),
            Action::ContinueAsNew { .. } => "ContinueAsNew".to_string(),
        }
    }

    /// The history record the host writes when it accepts this action, if any.
    pub(crate) fn record_kind(&self) -> Option<RecordKind> {
        match self {
            Action::CallActivity { .. } | Action::CallHttp { .. } => Some(RecordKind::Task),
            Action::CreateTimer { .. } => Some(RecordKind::Timer),
            Action::CallSubOrchestrator { .. } => Some(RecordKind::SubOrchestration),
            Action::CallEntity { .. }
            | Action::SignalEntity { .. }
            | Action::AcquireLock { .. }
            | Action::ReleaseLock { .. } => Some(RecordKind::EventSent),
            Action::WaitForExternalEvent { .. } | Action::ContinueAsNew { .. } => None,
        }
    }

    /// Check a recorded scheduling event against this action.
    ///
    /// Matching is by kind and target name; inputs are only compared when `strict_inputs` is set.
    pub(crate) fn matches_record(&self, record: &HistoryEventKind, strict_inputs: bool) -> bool {
        match (self, record) {
            (
                Action::CallActivity {
                    function_name, input, ..
                },
                HistoryEventKind::TaskScheduled { name, input: recorded },
            ) => function_name == name && (!strict_inputs || input == recorded),
            (Action::CallHttp { .. }, HistoryEventKind::TaskScheduled { name, .. }) => name == HTTP_ACTIVITY_NAME,
            (Action::CreateTimer { .. }, HistoryEventKind::TimerCreated { .. }) => true,
            (
                Action::CallSubOrchestrator {
                    function_name, input, ..
                },
                HistoryEventKind::SubOrchestrationInstanceCreated { name, input: recorded, .. },
            ) => function_name == name && (!strict_inputs || input == recorded),
            (
                Action::CallEntity {
                    entity_id, operation, ..
                }
                | Action::SignalEntity {
                    entity_id, operation, ..
                },
                HistoryEventKind::EventSent { instance_id, name, input },
            ) => {
                name == ENTITY_REQUEST_EVENT
                    && *instance_id == entity_id.scheduler_id()
                    && recorded_operation(input.as_ref()).is_none_or(|op| op == *operation)
            }
            (Action::AcquireLock { lock_set, .. }, HistoryEventKind::EventSent { instance_id, name, .. }) => {
                name == ENTITY_REQUEST_EVENT && lock_set.first().is_some_and(|e| *instance_id == e.scheduler_id())
            }
            (Action::ReleaseLock { lock_set, .. }, HistoryEventKind::EventSent { instance_id, name, .. }) => {
                name == ENTITY_RELEASE_EVENT && lock_set.first().is_some_and(|e| *instance_id == e.scheduler_id())
            }
            _ => false,
        }
    }
}

fn recorded_operation(input: Option<&Value>) -> Option<String> {
    input
        .and_then(|v| v.get("op"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(crate) fn normalize_lock_set(mut entities: Vec<EntityId>) -> Result<Vec<EntityId>, ValidationError> {
    if entities.is_empty() {
        return Err(ValidationError::Lock("lock set must contain at least one entity".into()));
    }
    entities.sort_by_key(EntityId::scheduler_id);
    entities.dedup();
    Ok(entities)
}

/// Retry policy for activity and sub-orchestration calls.
///
/// The engine re-issues a failed call after an internal timer. The first call
/// counts as attempt 1; the delay before attempt `n + 1` is
/// `first_retry_interval * backoff_coefficient^(n - 1)`, capped at `max_retry_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    #[serde(rename = "firstRetryIntervalInMilliseconds")]
    pub first_retry_interval_ms: u64,
    #[serde(rename = "maxNumberOfAttempts")]
    pub max_number_of_attempts: u32,
    pub backoff_coefficient: f64,
    #[serde(rename = "maxRetryIntervalInMilliseconds", default)]
    pub max_retry_interval_ms: Option<u64>,
    #[serde(rename = "retryTimeoutInMilliseconds", default)]
    pub retry_timeout_ms: Option<u64>,
}

impl RetryOptions {
    pub fn new(first_retry_interval: Duration, max_number_of_attempts: u32) -> Self {
        Self {
            first_retry_interval_ms: first_retry_interval.as_millis() as u64,
            max_number_of_attempts,
            backoff_coefficient: 1.0,
            max_retry_interval_ms: None,
            retry_timeout_ms: None,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval(mut self, max: Duration) -> Self {
        self.max_retry_interval_ms = Some(max.as_millis() as u64);
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.first_retry_interval_ms == 0 {
            return Err(ValidationError::RetryOptions(
                "first retry interval must be greater than zero".into(),
            ));
        }
        if self.max_number_of_attempts == 0 {
            return Err(ValidationError::RetryOptions("max number of attempts must be at least 1".into()));
        }
        if !(self.backoff_coefficient.is_finite() && self.backoff_coefficient > 0.0) {
            return Err(ValidationError::RetryOptions(
                "backoff coefficient must be a positive number".into(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut ms = self.first_retry_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        if let Some(max) = self.max_retry_interval_ms {
            ms = ms.min(max as f64);
        }
        Duration::from_millis(ms.clamp(0.0, u64::MAX as f64) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentityTokenSource {
    pub resource: String,
}

/// An HTTP request executed durably by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableHttpRequest {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub token_source: Option<ManagedIdentityTokenSource>,
    /// Let the host follow `202 Accepted` + `Location` polling on the caller's behalf.
    #[serde(default = "default_async_pattern")]
    pub async_pattern_enabled: bool,
}

fn default_async_pattern() -> bool {
    true
}

impl DurableHttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            content: None,
            headers: BTreeMap::new(),
            token_source: None,
            async_pattern_enabled: true,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_token_source(mut self, resource: impl Into<String>) -> Self {
        self.token_source = Some(ManagedIdentityTokenSource {
            resource: resource.into(),
        });
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_name(&self.method, "http method")?;
        require_name(&self.uri, "http uri")?;
        if !(self.uri.starts_with("http://") || self.uri.starts_with("https://")) {
            return Err(ValidationError::HttpRequest(format!(
                "uri '{}' must be an absolute http(s) uri",
                self.uri
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableHttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content: Option<String>,
}
