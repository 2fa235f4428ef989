//! Data model shared across tern.
//!
//! This module contains the invocation request, memory budgets and the
//! outcome/response types that flow back to the caller.

pub mod invocation;
pub mod memory;
pub mod outcome;

pub use invocation::{InvocationContext, InvocationRequest, IsolationKind, ScopeInfo, StoreEndpoint};
pub use memory::MemoryBudget;
pub use outcome::{HandlerError, HandlerErrorKind, HandlerOutcome, WorkerFailure, WorkerResponse};
