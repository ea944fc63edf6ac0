//! Host-facing surface: orchestration handlers, run requests and outcomes.

pub mod observability;
pub mod replay_engine;

pub use observability::{LogFormat, ObservabilityConfig, init_logging};
pub use replay_engine::ReplayEngine;

use crate::actions::PendingAction;
use crate::errors::{ErrorDetails, Fault};
use crate::history::HistoryEvent;
use crate::OrchestrationContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Orchestration procedure invoked by the replay engine on every run.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<Value>) -> Result<Value, Fault>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<Value>) -> Result<Value, Fault> {
        (self.f)(ctx, input).await
    }
}

/// Wrap an async function as a shareable handler.
pub fn orchestration<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    Arc::new(FnOrchestration::new(f))
}

/// Engine behavior switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayOptions {
    /// Also compare recorded inputs when matching scheduling records.
    pub strict_input_matching: bool,
    /// Keep an orchestration `Running` after it returns while uncanceled timers are still pending.
    pub wait_for_outstanding_timers: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            strict_input_matching: false,
            wait_for_outstanding_timers: true,
        }
    }
}

/// One invocation's worth of input from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRequest {
    pub instance_id: String,
    #[serde(default)]
    pub parent_instance_id: Option<String>,
    /// Falls back to the `ExecutionStarted` input when absent.
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl OrchestrationRequest {
    pub fn new(instance_id: impl Into<String>, history: Vec<HistoryEvent>) -> Self {
        Self {
            instance_id: instance_id.into(),
            parent_instance_id: None,
            input: None,
            history,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_parent(mut self, parent_instance_id: impl Into<String>) -> Self {
        self.parent_instance_id = Some(parent_instance_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
    ContinuedAsNew,
}

/// What the host gets back from one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub status: OrchestrationStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorDetails>,
    /// New actions for the host to carry out, in issuance order.
    #[serde(default)]
    pub actions: Vec<PendingAction>,
    #[serde(default)]
    pub custom_status: Option<Value>,
}

impl OrchestratorState {
    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed | OrchestrationStatus::ContinuedAsNew
        )
    }

    /// True when the run ended on a non-determinism error.
    pub fn is_nondeterministic(&self) -> bool {
        self.error.as_ref().is_some_and(ErrorDetails::is_nondeterminism)
    }
}
