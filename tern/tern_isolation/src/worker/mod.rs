//! Isolated workers.
//!
//! A worker takes one invocation from a SyncChannel, runs it in a separate
//! process and writes the response back. The coordinating side of every
//! worker runs on a supervisor thread; only the handler runs in the child.

mod balloon;
mod scale;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tern_core::error::ErrorClass;
use tern_core::types::{IsolationKind, WorkerFailure, WorkerResponse};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tern_core::InvocationId;
use tracing::debug;

use crate::channel::WorkerEndpoint;
use crate::resource::RetryPolicy;

pub use balloon::BalloonWorker;
pub use scale::ScaleWorker;

/// Exit code of a child whose handler failed.
pub(crate) const EXIT_HANDLER_FAILED: i32 = 3;

/// Exit code of a child that never received its request.
pub(crate) const EXIT_NO_REQUEST: i32 = 4;

/// Exit code of a child that could not deliver its result.
pub(crate) const EXIT_UNDELIVERED: i32 = 5;

/// Exit code of a child that could not join its scope.
pub(crate) const EXIT_JOIN_FAILED: i32 = 6;

/// Timing settings shared by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How long a worker waits for the caller's request.
    pub handoff_timeout: Duration,

    /// Bound on handler execution.
    pub invocation_timeout: Duration,

    /// How long a worker waits for the caller to take the response.
    pub reply_timeout: Duration,

    /// How long a scale child stays alive after delivering its result.
    pub child_linger: Duration,

    /// Grace period between SIGTERM and SIGKILL when reaping.
    pub reap_timeout: Duration,

    /// Scope removal schedule.
    pub teardown: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_secs(5),
            invocation_timeout: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(5),
            child_linger: Duration::from_secs(10),
            reap_timeout: Duration::from_secs(2),
            teardown: RetryPolicy::default(),
        }
    }
}

/// How a worker's invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The handler ran and succeeded.
    Succeeded,
    /// The handler ran and failed; the failure was delivered as data.
    HandlerFailed,
    /// The handler did not finish within its deadline.
    TimedOut,
    /// The infrastructure failed.
    Failed(ErrorClass),
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::HandlerFailed => f.write_str("handler failed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Failed(class) => write!(f, "failed ({})", class),
        }
    }
}

/// What a worker reports to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// The invocation.
    pub invocation_id: InvocationId,

    /// The worker kind.
    pub kind: IsolationKind,

    /// How the invocation ended.
    pub status: WorkerStatus,

    /// Whether a resource scope was left behind.
    pub scope_leaked: bool,
}

impl WorkerReport {
    pub(crate) fn new(invocation_id: InvocationId, kind: IsolationKind, status: WorkerStatus) -> Self {
        Self {
            invocation_id,
            kind,
            status,
            scope_leaked: false,
        }
    }
}

/// A worker that runs one invocation per call.
pub trait IsolationWorker: Send + Sync {
    /// The isolation kind this worker provides.
    fn kind(&self) -> IsolationKind;

    /// Serve the invocation waiting on `channel`.
    ///
    /// # Arguments
    ///
    /// * `invocation_id` - The invocation, for logs and the report.
    /// * `channel` - Path of the invocation's SyncChannel.
    /// * `cancel` - Abandons every wait when cancelled. Scopes are still
    ///   reclaimed.
    fn run(&self, invocation_id: InvocationId, channel: &Path, cancel: &CancellationToken) -> WorkerReport;
}

/// Write a failure response, if the caller is still listening.
pub(crate) fn reply_failure(endpoint: &WorkerEndpoint, failure: WorkerFailure, timeout: Duration) {
    let response = WorkerResponse::Failed { failure };
    // A fresh token: the caller must learn the outcome even when the
    // worker itself was cancelled.
    if let Err(e) = endpoint.reply(&response, Deadline::after(timeout), &CancellationToken::new()) {
        debug!(channel = %endpoint.path().display(), error = %e, "Failure response not delivered");
    }
}
