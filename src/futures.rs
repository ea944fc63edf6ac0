//! Task handles returned by [`OrchestrationContext`](crate::OrchestrationContext).
//!
//! A handle is a cheap index into the context's task arena. Awaiting it yields
//! the task (assigning its sequence number and issuing its action) and then
//! resolves once the replay engine applies the matching history event.

use crate::actions::{Action, PendingAction};
use crate::context::{OrchestrationContext, TaskId, TaskState};
use crate::errors::Fault;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A pending or resolved request.
///
/// Awaiting produces `Ok(result)` or the fault recorded for it. Awaiting
/// consumes the handle; keep a clone to inspect the task afterwards.
#[derive(Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) ctx: OrchestrationContext,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.ctx
            .with_task(self.id, |t| !matches!(t.state, TaskState::Pending))
    }

    pub fn is_faulted(&self) -> bool {
        self.ctx
            .with_task(self.id, |t| matches!(t.state, TaskState::Faulted(_)))
    }

    /// Result payload; present only once completed without a fault.
    pub fn result(&self) -> Option<Value> {
        self.ctx.with_task(self.id, |t| match &t.state {
            TaskState::Completed(v) => Some(v.clone()),
            _ => None,
        })
    }

    pub fn fault(&self) -> Option<Fault> {
        self.ctx.with_task(self.id, |t| match &t.state {
            TaskState::Faulted(f) => Some(f.clone()),
            _ => None,
        })
    }

    /// The originating action. Task sets have none.
    pub fn action(&self) -> Option<Action> {
        self.ctx.with_task(self.id, |t| t.action().cloned())
    }

    /// Issuance order within the current execution, assigned when the task is first yielded.
    pub fn sequence_number(&self) -> Option<u32> {
        self.ctx.with_task(self.id, |t| t.sequence_number)
    }

    /// `event_id` of the history event that resolved this task.
    pub fn completion_index(&self) -> Option<u64> {
        self.ctx.with_task(self.id, |t| t.completion_index)
    }

    /// Actions issued by yielding this task, whether replayed from history or new; empty on every later call.
    pub fn yield_new_actions(&self) -> Vec<PendingAction> {
        self.ctx.take_new_actions(self.id)
    }

    /// Await the task and decode its result.
    pub async fn output_typed<T: DeserializeOwned>(self) -> Result<T, Fault> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for Task {
    type Output = Result<Value, Fault>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.poll_task(self.id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("sequence_number", &self.sequence_number())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A durable timer. Resolves with `null` when it fires.
#[derive(Clone, Debug)]
pub struct TimerTask {
    pub(crate) task: Task,
}

impl TimerTask {
    /// Cancel the timer; the cancellation goes out with the next action batch.
    ///
    /// Canceling a timer that already fired terminates the run with an
    /// `InvalidOperation` error.
    pub fn cancel(&self) {
        self.task.ctx.cancel_timer(self.task.id);
    }

    pub fn is_canceled(&self) -> bool {
        self.task.ctx.with_task(self.task.id, |t| t.canceled)
    }
}

impl Deref for TimerTask {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl Future for TimerTask {
    type Output = Result<Value, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx)
    }
}

impl From<TimerTask> for Task {
    fn from(timer: TimerTask) -> Self {
        timer.task
    }
}

/// Aggregate over a fixed list of tasks, built by `task_all` or `task_any`.
///
/// Behaves like a [`Task`], so sets nest inside other sets.
#[derive(Clone, Debug)]
pub struct TaskSet {
    pub(crate) task: Task,
}

impl TaskSet {
    /// Resolves to the member that settled a `task_any` set.
    /// For a `task_all` set this is the set itself.
    pub fn winner(&self) -> Winner {
        Winner {
            set: self.task.clone(),
        }
    }
}

impl Deref for TaskSet {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl Future for TaskSet {
    type Output = Result<Value, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx)
    }
}

impl From<TaskSet> for Task {
    fn from(set: TaskSet) -> Self {
        set.task
    }
}

/// Future returned by [`TaskSet::winner`].
#[derive(Debug)]
pub struct Winner {
    set: Task,
}

impl Future for Winner {
    type Output = Task;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Task> {
        self.set.ctx.poll_winner(self.set.id)
    }
}
