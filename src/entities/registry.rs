//! Operation-name to handler mapping for one entity type.

use super::EntityContext;
use crate::errors::{Fault, ValidationError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Runs one entity operation against the batch's in-memory state.
///
/// `Ok(Some(value))` becomes the caller's response unless the handler called
/// [`EntityContext::return_value`]; `Err` rolls the state back to what it was
/// before the operation started.
pub trait OperationHandler<S>: Send + Sync {
    fn handle(&self, ctx: &mut EntityContext<S>) -> Result<Option<Value>, Fault>;
}

struct FnOperation<F>(F);

impl<S, F> OperationHandler<S> for FnOperation<F>
where
    F: Fn(&mut EntityContext<S>) -> Result<Option<Value>, Fault> + Send + Sync,
{
    fn handle(&self, ctx: &mut EntityContext<S>) -> Result<Option<Value>, Fault> {
        (self.0)(ctx)
    }
}

/// Immutable mapping from operation name to handler.
pub struct EntityRegistry<S> {
    handlers: Arc<HashMap<String, Arc<dyn OperationHandler<S>>>>,
    default: Option<Arc<dyn OperationHandler<S>>>,
}

impl<S> Clone for EntityRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            default: self.default.clone(),
        }
    }
}

impl<S: 'static> EntityRegistry<S> {
    pub fn builder() -> EntityRegistryBuilder<S> {
        EntityRegistryBuilder {
            handlers: HashMap::new(),
            default: None,
            errors: Vec::new(),
        }
    }

    /// Handler for `operation`, falling back to the default handler when one is registered.
    pub fn resolve(&self, operation: &str) -> Option<Arc<dyn OperationHandler<S>>> {
        self.handlers.get(operation).cloned().or_else(|| self.default.clone())
    }

    pub fn has(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn list_operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct EntityRegistryBuilder<S> {
    handlers: HashMap<String, Arc<dyn OperationHandler<S>>>,
    default: Option<Arc<dyn OperationHandler<S>>>,
    errors: Vec<String>,
}

impl<S: 'static> EntityRegistryBuilder<S> {
    pub fn register<F>(self, operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut EntityContext<S>) -> Result<Option<Value>, Fault> + Send + Sync + 'static,
    {
        self.register_handler(operation, Arc::new(FnOperation(f)))
    }

    pub fn register_handler(mut self, operation: impl Into<String>, handler: Arc<dyn OperationHandler<S>>) -> Self {
        let operation = operation.into();
        if operation.trim().is_empty() {
            self.errors.push("operation name must not be empty".to_string());
            return self;
        }
        if self.handlers.contains_key(&operation) {
            self.errors.push(format!("duplicate operation registration: {operation}"));
            return self;
        }
        self.handlers.insert(operation, handler);
        self
    }

    /// Handler for operation names nothing else matched.
    pub fn default_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut EntityContext<S>) -> Result<Option<Value>, Fault> + Send + Sync + 'static,
    {
        if self.default.is_some() {
            self.errors.push("default handler registered twice".to_string());
            return self;
        }
        self.default = Some(Arc::new(FnOperation(f)));
        self
    }

    pub fn build(self) -> Result<EntityRegistry<S>, ValidationError> {
        if !self.errors.is_empty() {
            return Err(ValidationError::Registration(self.errors.join("; ")));
        }
        Ok(EntityRegistry {
            handlers: Arc::new(self.handlers),
            default: self.default,
        })
    }
}
