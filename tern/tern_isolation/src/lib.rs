//! # Tern Isolation
//!
//! `tern_isolation` runs invocations away from the caller. It provides:
//!
//! 1. **SyncChannel**: a named FIFO carrying exactly one request frame from
//!    the caller to a worker and one response frame back.
//!
//! 2. **Resource scopes**: filesystem-backed memory-accounting boundaries
//!    with a budget, joined by process id and torn down with retries.
//!
//! 3. **Process spawning**: fork with a typed result pipe, bounded reaping
//!    and forced termination.
//!
//! 4. **Workers**: the balloon worker (fresh process, no ceiling) and the
//!    scale worker (forked child inside a dedicated scope).

pub mod channel;
pub mod frame;
pub mod process;
pub mod resource;
pub mod worker;

mod naming;

pub use channel::{ResponseReader, SyncChannel, WorkerEndpoint};
pub use process::{fork, fork_with_output, ChildExit, ForkedChild, InputPipe, OutputPipe};
pub use resource::{
    CgroupController, ControlFiles, DirectoryController, ResourceScope, RetryPolicy,
    ScopeController, ScopeName,
};
pub use worker::{
    BalloonWorker, IsolationWorker, ScaleWorker, WorkerReport, WorkerSettings, WorkerStatus,
};
