//! The entity dispatch loop.

use super::{
    EntityBatchRequest, EntityBatchResult, EntityId, EntityRegistry, OperationResult, OutgoingSignal, RequestKind,
    RequestMessage, SchedulerState,
};
use crate::errors::{Fault, ValidationError, panic_message};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

const SIGNAL_NAMESPACE: Uuid = Uuid::from_u128(0x6f0e_1a42_9c3b_4d8e_a1f7_3b2c_5d9e_0a14);

/// View of the entity handed to an operation handler.
pub struct EntityContext<S> {
    entity_id: EntityId,
    operation: String,
    input: Option<Value>,
    state: S,
    is_new: bool,
    written: bool,
    return_value: Option<Value>,
    destruct: bool,
    signals: Vec<OutgoingSignal>,
    request_id: String,
}

impl<S> EntityContext<S> {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn entity_name(&self) -> &str {
        self.entity_id.name()
    }

    pub fn entity_key(&self) -> &str {
        self.entity_id.key()
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    /// True until some operation has written state.
    pub fn is_new_entity(&self) -> bool {
        self.is_new
    }

    pub fn raw_input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn input<T: DeserializeOwned>(&self) -> Result<T, Fault> {
        Ok(serde_json::from_value(self.input.clone().unwrap_or(Value::Null))?)
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        self.written = true;
        &mut self.state
    }

    pub fn set_state(&mut self, state: S) {
        self.written = true;
        self.state = state;
    }

    /// Response for the caller, taking precedence over the handler's return value.
    pub fn return_value(&mut self, value: impl Serialize) -> Result<(), Fault> {
        self.return_value = Some(serde_json::to_value(value)?);
        Ok(())
    }

    /// Delete the entity once the batch finishes.
    pub fn destruct_on_exit(&mut self) {
        self.destruct = true;
    }

    /// One-way message to another entity, delivered only if this operation succeeds.
    pub fn signal_entity(
        &mut self,
        target: EntityId,
        operation: impl Into<String>,
        input: impl Serialize,
    ) -> Result<(), ValidationError> {
        let operation = operation.into();
        if operation.trim().is_empty() {
            return Err(ValidationError::Empty {
                what: "entity operation name",
            });
        }
        let input = serde_json::to_value(input).map_err(|e| ValidationError::Payload(e.to_string()))?;
        let seed = format!(
            "{}_{}_{}",
            self.entity_id.scheduler_id(),
            self.request_id,
            self.signals.len()
        );
        let id = Uuid::new_v5(&SIGNAL_NAMESPACE, seed.as_bytes()).to_string();
        let input = (!input.is_null()).then_some(input);
        self.signals.push(OutgoingSignal {
            target,
            message: RequestMessage::signal(id, operation, input, Some(self.entity_id.scheduler_id())),
        });
        Ok(())
    }
}

/// Applies batches of queued requests to entities of one type.
pub struct EntityDispatcher<S> {
    registry: EntityRegistry<S>,
    initial_state: Arc<dyn Fn() -> S + Send + Sync>,
}

impl<S> EntityDispatcher<S>
where
    S: Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn new(registry: EntityRegistry<S>, initial_state: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            registry,
            initial_state: Arc::new(initial_state),
        }
    }

    pub fn with_default_state(registry: EntityRegistry<S>) -> Self
    where
        S: Default,
    {
        Self::new(registry, S::default)
    }

    pub fn dispatch(&self, request: EntityBatchRequest) -> EntityBatchResult {
        let EntityBatchRequest { entity_id, state } = request;
        let SchedulerState {
            exists,
            state: serialized,
            queue,
            locked_by,
        } = state;

        debug!(
            target: "durable_replay::entity",
            entity = %entity_id,
            queued = queue.len(),
            exists,
            "dispatching entity batch"
        );

        let decoded = match (exists, serialized.as_deref()) {
            (true, Some(raw)) => serde_json::from_str::<S>(raw).map_err(|e| e.to_string()),
            _ => Ok((self.initial_state)()),
        };
        let (state, undecodable) = match decoded {
            Ok(state) => (state, None),
            Err(reason) => {
                error!(target: "durable_replay::entity", entity = %entity_id, error = %reason, "entity state could not be decoded");
                let undecodable = Undecodable {
                    raw: serialized.clone(),
                    reason,
                };
                ((self.initial_state)(), Some(undecodable))
            }
        };

        let mut batch = Batch {
            entity_id,
            state,
            exists,
            undecodable,
            locked_by,
            destruct: false,
            results: Vec::new(),
            signals: Vec::new(),
        };
        let mut pending: VecDeque<RequestMessage> = queue.into();
        let mut deferred: Vec<RequestMessage> = Vec::new();

        while let Some(request) = pending.pop_front() {
            let held_by_other = batch
                .locked_by
                .as_deref()
                .is_some_and(|holder| request.parent.as_deref() != Some(holder));
            if held_by_other {
                deferred.push(request);
                continue;
            }
            match request.kind() {
                Some(RequestKind::Call) | Some(RequestKind::Signal) => self.execute(&mut batch, request),
                Some(RequestKind::Lock) => batch.grant_lock(request),
                Some(RequestKind::Release) => {
                    batch.release_lock(request);
                    // requests held back by the lock get their turn now, ahead of later arrivals
                    for r in deferred.drain(..).rev() {
                        pending.push_front(r);
                    }
                }
                None => warn!(
                    target: "durable_replay::entity",
                    entity = %batch.entity_id,
                    request_id = %request.id,
                    "dropping malformed entity request"
                ),
            }
        }

        batch.finish(deferred)
    }

    /// Host boundary: JSON `EntityBatchRequest` in, JSON `EntityBatchResult` out.
    pub fn dispatch_json(&self, request: &str) -> Result<String, serde_json::Error> {
        let request: EntityBatchRequest = serde_json::from_str(request)?;
        serde_json::to_string(&self.dispatch(request))
    }

    fn execute(&self, batch: &mut Batch<S>, request: RequestMessage) {
        let operation = request.op.clone().unwrap_or_default();
        if let Some(undecodable) = &batch.undecodable {
            let fault = Fault::new(format!(
                "state of {} could not be decoded: {}",
                batch.entity_id, undecodable.reason
            ));
            if request.signal {
                warn!(
                    target: "durable_replay::entity",
                    entity = %batch.entity_id,
                    operation = %operation,
                    request_id = %request.id,
                    "dropping signal for entity with undecodable state"
                );
            }
            batch.respond(&request, Err(fault), 0);
            return;
        }
        let Some(handler) = self.registry.resolve(&operation) else {
            warn!(
                target: "durable_replay::entity",
                entity = %batch.entity_id,
                operation = %operation,
                "no handler registered for entity operation; ignoring"
            );
            batch.respond(&request, Ok(None), 0);
            return;
        };

        let mut ctx = EntityContext {
            entity_id: batch.entity_id.clone(),
            operation: operation.clone(),
            input: request.input.clone(),
            state: batch.state.clone(),
            is_new: !batch.exists,
            written: false,
            return_value: None,
            destruct: false,
            signals: Vec::new(),
            request_id: request.id.clone(),
        };

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&mut ctx)))
            .unwrap_or_else(|panic| Err(Fault::new(format!("entity operation panicked: {}", panic_message(&*panic)))));
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let EntityContext {
                    state,
                    written,
                    return_value,
                    destruct,
                    signals,
                    ..
                } = ctx;
                if written {
                    batch.state = state;
                    batch.exists = true;
                }
                batch.destruct |= destruct;
                batch.signals.extend(signals);
                batch.respond(&request, Ok(return_value.or(value)), duration_ms);
            }
            Err(fault) => {
                warn!(
                    target: "durable_replay::entity",
                    entity = %batch.entity_id,
                    operation = %operation,
                    error = %fault,
                    "entity operation failed; state rolled back"
                );
                batch.respond(&request, Err(fault), duration_ms);
            }
        }
    }
}

/// Stored state that failed to decode. Operations fail and the raw state is kept as is.
struct Undecodable {
    raw: Option<String>,
    reason: String,
}

struct Batch<S> {
    entity_id: EntityId,
    state: S,
    exists: bool,
    undecodable: Option<Undecodable>,
    locked_by: Option<String>,
    destruct: bool,
    results: Vec<OperationResult>,
    signals: Vec<OutgoingSignal>,
}

impl<S: Serialize> Batch<S> {
    fn respond(&mut self, request: &RequestMessage, outcome: Result<Option<Value>, Fault>, duration_ms: u64) {
        if request.signal {
            return;
        }
        let (is_error, result) = match outcome {
            Ok(value) => (false, value.map(|v| v.to_string())),
            Err(fault) => (true, Some(fault.to_string())),
        };
        self.results.push(OperationResult {
            request_id: request.id.clone(),
            is_error,
            result,
            duration_ms,
        });
    }

    fn grant_lock(&mut self, request: RequestMessage) {
        self.locked_by = request.parent.clone();
        debug!(
            target: "durable_replay::entity",
            entity = %self.entity_id,
            holder = ?self.locked_by,
            critical_section = %request.id,
            "entity lock granted"
        );
        match request.forward() {
            Some((target, message)) => self.signals.push(OutgoingSignal { target, message }),
            None => self.results.push(OperationResult {
                request_id: request.id,
                is_error: false,
                result: None,
                duration_ms: 0,
            }),
        }
    }

    fn release_lock(&mut self, request: RequestMessage) {
        if self.locked_by.is_some() && self.locked_by == request.parent {
            self.locked_by = None;
        } else {
            warn!(
                target: "durable_replay::entity",
                entity = %self.entity_id,
                holder = ?self.locked_by,
                sender = ?request.parent,
                "release from an instance that does not hold the lock"
            );
        }
        if let Some((target, message)) = request.forward() {
            self.signals.push(OutgoingSignal { target, message });
        }
    }

    fn finish(self, deferred: Vec<RequestMessage>) -> EntityBatchResult {
        let (exists, state) = if let Some(undecodable) = self.undecodable {
            (true, undecodable.raw)
        } else if self.destruct {
            (false, None)
        } else if self.exists {
            match serde_json::to_string(&self.state) {
                Ok(raw) => (true, Some(raw)),
                Err(e) => {
                    error!(target: "durable_replay::entity", entity = %self.entity_id, error = %e, "entity state could not be encoded");
                    (false, None)
                }
            }
        } else {
            (false, None)
        };
        EntityBatchResult {
            scheduler_state: SchedulerState {
                exists,
                state,
                queue: deferred,
                locked_by: self.locked_by,
            },
            results: self.results,
            signals: self.signals,
        }
    }
}
