//! Balloon worker.
//!
//! Runs one invocation in a fresh child process with no memory ceiling of
//! its own. The child talks to the caller through the SyncChannel directly;
//! the coordinating thread only bounds the child's lifetime.

use std::path::Path;
use std::sync::Arc;

use tern_core::error::{Error, ErrorClass};
use tern_core::types::{InvocationRequest, IsolationKind, WorkerFailure, WorkerResponse};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tern_core::{HandlerContext, HandlerRegistry, InvocationId};
use tracing::{debug, info, warn};

use crate::channel::WorkerEndpoint;
use crate::process::{self, ChildExit};
use crate::worker::{
    reply_failure, IsolationWorker, WorkerReport, WorkerSettings, WorkerStatus,
    EXIT_HANDLER_FAILED, EXIT_NO_REQUEST, EXIT_UNDELIVERED,
};

/// Worker that runs each invocation in its own process.
#[derive(Debug, Clone)]
pub struct BalloonWorker {
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
}

impl BalloonWorker {
    /// Create a balloon worker.
    pub fn new(registry: Arc<HandlerRegistry>, settings: WorkerSettings) -> Self {
        Self { registry, settings }
    }

    /// Child side: serve the channel and exit.
    fn serve(registry: &HandlerRegistry, endpoint: &WorkerEndpoint, settings: &WorkerSettings) -> i32 {
        let cancel = CancellationToken::new();
        let request: InvocationRequest =
            match endpoint.receive(Deadline::after(settings.handoff_timeout), &cancel) {
                Ok(request) => request,
                Err(_) => return EXIT_NO_REQUEST,
            };

        let ctx = HandlerContext::isolated(request.id, &request.context);
        let outcome = registry.invoke(&request.function, &request.arguments, &ctx);
        let code = if outcome.is_ok() { 0 } else { EXIT_HANDLER_FAILED };

        let response = WorkerResponse::Completed { outcome };
        match endpoint.reply(&response, Deadline::after(settings.reply_timeout), &cancel) {
            Ok(()) => code,
            Err(_) => EXIT_UNDELIVERED,
        }
    }

    fn status_of(exit: ChildExit) -> WorkerStatus {
        match exit {
            ChildExit::Exited(0) => WorkerStatus::Succeeded,
            ChildExit::Exited(EXIT_HANDLER_FAILED) => WorkerStatus::HandlerFailed,
            _ => WorkerStatus::Failed(ErrorClass::Internal),
        }
    }
}

impl IsolationWorker for BalloonWorker {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Balloon
    }

    fn run(&self, invocation_id: InvocationId, channel: &Path, cancel: &CancellationToken) -> WorkerReport {
        let endpoint = WorkerEndpoint::new(channel);
        let report = |status| WorkerReport::new(invocation_id, IsolationKind::Balloon, status);

        let registry = Arc::clone(&self.registry);
        let settings = self.settings;
        let child_endpoint = endpoint.clone();
        let mut child = match process::fork(move || Self::serve(&registry, &child_endpoint, &settings)) {
            Ok(child) => child,
            Err(e) => {
                warn!(invocation_id = %invocation_id, error = %e, "Failed to fork balloon worker");
                reply_failure(&endpoint, WorkerFailure::from(&e), self.settings.reply_timeout);
                return report(WorkerStatus::Failed(e.class()));
            }
        };

        debug!(invocation_id = %invocation_id, pid = child.pid(), "Spawned balloon worker");

        let lifetime = self.settings.handoff_timeout
            + self.settings.invocation_timeout
            + self.settings.reply_timeout;

        match child.reap(Deadline::after(lifetime), cancel) {
            Ok(exit) => {
                let status = Self::status_of(exit);
                info!(invocation_id = %invocation_id, pid = child.pid(), %exit, %status, "Balloon worker finished");
                report(status)
            }
            Err(e) => {
                if let Err(kill_err) = child.kill_and_reap() {
                    warn!(invocation_id = %invocation_id, error = %kill_err, "Failed to reap balloon worker");
                }
                let (status, failure) = match e {
                    Error::Cancelled(_) => (
                        WorkerStatus::Failed(ErrorClass::Cancelled),
                        WorkerFailure::new(ErrorClass::Cancelled, "balloon worker cancelled"),
                    ),
                    _ => (
                        WorkerStatus::TimedOut,
                        WorkerFailure::new(
                            ErrorClass::Timeout,
                            format!("balloon worker exceeded {} ms", lifetime.as_millis()),
                        ),
                    ),
                };
                warn!(invocation_id = %invocation_id, pid = child.pid(), %status, "Balloon worker killed");
                reply_failure(&endpoint, failure, self.settings.reply_timeout);
                report(status)
            }
        }
    }
}
