//! Deterministic replay engine for durable orchestrations.
//!
//! An orchestration is an ordinary `async fn` that receives an
//! [`OrchestrationContext`]. On every invocation the host hands the engine the
//! full history recorded so far; the engine re-runs the function from the top,
//! feeds recorded results back into the awaits that asked for them, and returns
//! whatever new work the function asked for as a batch of [`Action`]s.
//!
//! ```ignore
//! use durable_replay::{OrchestrationContext, Fault};
//! use serde_json::Value;
//!
//! async fn hello_cities(ctx: OrchestrationContext, _input: Option<Value>) -> Result<Value, Fault> {
//!     let tokyo = ctx.call_activity("SayHello", "Tokyo").await?;
//!     let seattle = ctx.call_activity("SayHello", "Seattle").await?;
//!     let cairo = ctx.call_activity("SayHello", "Cairo").await?;
//!     Ok(serde_json::json!([tokyo, seattle, cairo]))
//! }
//! ```
//!
//! Orchestration code must be deterministic: use
//! [`OrchestrationContext::current_utc_date_time`] and
//! [`OrchestrationContext::new_guid`] instead of the system clock or random ids,
//! and never block on I/O.
//!
//! Durable entities live in [`entities`]: the [`EntityDispatcher`] applies a
//! batch of queued operations to one entity's state and reports the results.

pub mod actions;
mod context;
pub mod entities;
pub mod errors;
pub mod futures;
pub mod history;
mod logging;
pub mod runtime;

pub use actions::{Action, DurableHttpRequest, DurableHttpResponse, PendingAction, RetryOptions};
pub use context::OrchestrationContext;
pub use entities::{
    EntityBatchRequest, EntityBatchResult, EntityContext, EntityDispatcher, EntityId, EntityRegistry,
    OperationResult, RequestMessage, SchedulerState,
};
pub use errors::{AppErrorKind, ConfigErrorKind, ErrorDetails, Fault, ValidationError};
pub use crate::futures::{Task, TaskSet, TimerTask, Winner};
pub use history::{HistoryEvent, HistoryEventKind};
pub use runtime::{
    OrchestrationHandler, OrchestrationRequest, OrchestrationStatus, OrchestratorState, ReplayEngine, ReplayOptions,
    orchestration,
};
