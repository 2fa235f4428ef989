//! # Tern Core
//!
//! `tern_core` provides the building blocks shared by every tern crate:
//! identifiers, the error taxonomy, the invocation data model, the
//! function-handler trait and its registry, and the deadline/cancellation
//! primitives that every blocking wait in the system is bounded by.
//!
//! ## Invocation model
//!
//! A caller asks the dispatcher to run a named function. The name selects
//! how the call is isolated:
//!
//! 1. **Direct**: no recognised suffix, the handler runs in the caller's
//!    execution context.
//!
//! 2. **Balloon**: the `-balloon` suffix runs the handler in a fresh worker
//!    process with no memory ceiling of its own.
//!
//! 3. **Scale**: the `-faascale` suffix runs the handler in a forked child
//!    that first joins a dedicated, budget-bounded resource scope.
//!
//! Handler failures are data (`HandlerOutcome::Failed`); infrastructure
//! failures are `error::Error` values classified by `ErrorClass`.

pub mod error;
pub mod id;
pub mod registry;
pub mod traits;
pub mod types;
pub mod utils;

pub use error::{Error, ErrorClass, Result};
pub use id::{InvocationId, WorkerId};
pub use registry::HandlerRegistry;
pub use traits::{FunctionHandler, HandlerContext};
pub use types::{
    HandlerError, HandlerErrorKind, HandlerOutcome, InvocationContext, InvocationRequest,
    IsolationKind, MemoryBudget, ScopeInfo, StoreEndpoint, WorkerFailure, WorkerResponse,
};
pub use utils::deadline::{CancellationToken, Deadline};
