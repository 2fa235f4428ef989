//! Handler registry.
//!
//! Maps function names to handlers. The registry is built once at startup
//! and never mutated afterwards, so it can be shared through an `Arc` with
//! the dispatcher and inherited by forked workers without locking.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::traits::{FunctionHandler, HandlerContext};
use crate::types::{HandlerError, HandlerErrorKind, HandlerOutcome};

/// An immutable mapping from function name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
}

impl HandlerRegistry {
    /// Start building a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve and run a handler.
    ///
    /// Unknown names and panics are turned into failed outcomes, never
    /// dropped. The registry itself never logs. A panicking handler still
    /// runs the process panic hook, so forked callers install a silent one.
    pub fn invoke(&self, name: &str, args: &Value, ctx: &HandlerContext) -> HandlerOutcome {
        let Some(handler) = self.handlers.get(name) else {
            return HandlerOutcome::failed(HandlerError::unknown_function(name));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(args, ctx))) {
            Ok(result) => result.into(),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                HandlerOutcome::failed(HandlerError::new(HandlerErrorKind::Panicked, message))
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Builder for `HandlerRegistry`.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler, replacing any previous one with the same name.
    pub fn register<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: FunctionHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a closure as a handler.
    pub fn register_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &HandlerContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, f)
    }

    /// Finish the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
