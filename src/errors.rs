//! Error taxonomy shared by the replay engine and the entity dispatch loop.
//!
//! Three layers:
//! - [`Fault`]: an ordinary failure value. Activity/sub-orchestration failures,
//!   aggregated `task_all` failures and failed entity calls are delivered to the
//!   procedure as `Err(Fault)` at the exact await that produced them.
//! - [`ValidationError`]: raised while constructing an action. Never enters
//!   history; terminates the run.
//! - [`ErrorDetails`]: the terminal error recorded on an [`OrchestratorState`](crate::runtime::OrchestratorState).
//!   `Application` wraps user faults, `Configuration` marks fatal, non-retryable
//!   conditions such as nondeterminism.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// A failure that flows back into orchestration code as a value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Fault {
    /// An activity, sub-orchestration or orchestration-raised failure.
    #[error("{reason}")]
    Failed { reason: String, details: Option<String> },
    /// Produced by `task_all` when one or more members faulted. Members appear in input order.
    #[error("{}", aggregate_message(.faults))]
    Aggregate { faults: Vec<Fault> },
    /// An entity operation reported an error to its caller.
    #[error("entity operation failed: {message}")]
    Entity {
        exception_type: Option<String>,
        message: String,
    },
}

fn aggregate_message(faults: &[Fault]) -> String {
    let joined = faults.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ");
    format!("{} task(s) failed: {joined}", faults.len())
}

impl Fault {
    pub fn new(reason: impl Into<String>) -> Self {
        Fault::Failed {
            reason: reason.into(),
            details: None,
        }
    }

    pub fn with_details(reason: impl Into<String>, details: impl Into<String>) -> Self {
        Fault::Failed {
            reason: reason.into(),
            details: Some(details.into()),
        }
    }

    /// Member faults for an aggregate, or a single-element slice otherwise.
    pub fn faults(&self) -> &[Fault] {
        match self {
            Fault::Aggregate { faults } => faults,
            other => std::slice::from_ref(other),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Fault::Aggregate { .. })
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Fault::Failed { details, .. } => details.as_deref(),
            Fault::Entity { exception_type, .. } => exception_type.as_deref(),
            Fault::Aggregate { .. } => None,
        }
    }
}

impl From<serde_json::Error> for Fault {
    fn from(e: serde_json::Error) -> Self {
        Fault::with_details("payload could not be decoded", e.to_string())
    }
}

impl From<ValidationError> for Fault {
    fn from(e: ValidationError) -> Self {
        Fault::new(e.to_string())
    }
}

/// Raised synchronously when an action is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{what} must not be empty")]
    Empty { what: &'static str },
    #[error("invalid retry options: {0}")]
    RetryOptions(String),
    #[error("invalid entity id '{0}'")]
    EntityId(String),
    #[error("invalid http request: {0}")]
    HttpRequest(String),
    #[error("invalid lock request: {0}")]
    Lock(String),
    #[error("payload could not be encoded: {0}")]
    Payload(String),
    #[error("registration failed: {0}")]
    Registration(String),
}

/// Classification of fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigErrorKind {
    /// Replay could not reconcile history with the actions the procedure issued.
    Nondeterminism,
    /// An action failed construction-time validation.
    Validation,
    /// The procedure performed an operation that is never legal, e.g. canceling a fired timer.
    InvalidOperation,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigErrorKind::Nondeterminism => "nondeterministic",
            ConfigErrorKind::Validation => "validation",
            ConfigErrorKind::InvalidOperation => "invalid operation",
        };
        f.write_str(s)
    }
}

/// Classification of user-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppErrorKind {
    OrchestrationFailed,
    Panicked,
}

impl fmt::Display for AppErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppErrorKind::OrchestrationFailed => f.write_str("orchestration failed"),
            AppErrorKind::Panicked => f.write_str("orchestration panicked"),
        }
    }
}

/// Terminal error attached to a failed orchestration turn.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ErrorDetails {
    #[error("{kind}: {message}")]
    Application {
        kind: AppErrorKind,
        message: String,
        details: Option<String>,
        retryable: bool,
    },
    #[error("{kind}: {}", .message.as_deref().unwrap_or("no details"))]
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
}

impl ErrorDetails {
    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }

    pub(crate) fn invalid_operation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::InvalidOperation,
            resource: resource.into(),
            message: Some(message.into()),
        }
    }

    pub(crate) fn from_fault(fault: &Fault) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::OrchestrationFailed,
            message: fault.to_string(),
            details: fault.details().map(str::to_string),
            retryable: false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
        }
    }

    /// Fatal errors must be surfaced to the host as unrecoverable for the instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorDetails::Configuration { .. })
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Application { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
        }
    }

    pub fn display_message(&self) -> String {
        self.to_string()
    }
}

impl From<ValidationError> for ErrorDetails {
    fn from(e: ValidationError) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Validation,
            resource: String::new(),
            message: Some(e.to_string()),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
