//! Function handler trait.
//!
//! A function handler is the unit of work an invocation runs. Handlers are
//! registered once at startup and are shared, read-only, by the dispatcher
//! and by every worker process.

use serde_json::Value;

use crate::id::InvocationId;
use crate::types::{HandlerError, InvocationContext, ScopeInfo, StoreEndpoint};

/// Context passed to a handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    /// The invocation, for isolated calls.
    pub invocation_id: Option<InvocationId>,

    /// The payload store the handler may use.
    pub store: StoreEndpoint,

    /// The scope the handler runs in, for scale invocations.
    pub scope: Option<ScopeInfo>,
}

impl HandlerContext {
    /// Context for a direct invocation.
    pub fn direct(context: &InvocationContext) -> Self {
        Self {
            invocation_id: None,
            store: context.store.clone(),
            scope: None,
        }
    }

    /// Context for an isolated invocation.
    pub fn isolated(id: InvocationId, context: &InvocationContext) -> Self {
        Self {
            invocation_id: Some(id),
            store: context.store.clone(),
            scope: None,
        }
    }

    /// Attach the scope the handler runs in.
    pub fn with_scope(mut self, scope: ScopeInfo) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// A function that can be invoked by name.
///
/// # Arguments
///
/// * `args` - The opaque argument payload.
/// * `ctx` - The invocation context.
///
/// # Returns
///
/// * `Ok(Value)` - The handler's result.
/// * `Err(HandlerError)` - The handler failed; the error is delivered to the
///   caller as data.
pub trait FunctionHandler: Send + Sync {
    /// Run the handler.
    fn call(&self, args: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError>;
}

impl<F> FunctionHandler for F
where
    F: Fn(&Value, &HandlerContext) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, args: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        self(args, ctx)
    }
}
