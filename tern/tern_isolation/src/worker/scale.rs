//! Scale worker.
//!
//! Runs one invocation inside a dedicated resource scope:
//!
//! 1. take the request from the SyncChannel;
//! 2. create a scope with a random name and write the budget;
//! 3. fork a child connected by a result pipe;
//! 4. the child joins the scope, runs the handler, sends the outcome and
//!    lingers so the parent can collect it before the scope empties;
//! 5. the parent reads the outcome, terminates and reaps the child, then
//!    tears the scope down;
//! 6. the parent writes the response into the SyncChannel.
//!
//! Every wait is bounded. A child that hangs or crashes is killed and
//! reaped and the scope is torn down before the caller hears about it.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_core::error::{ChannelError, Error, ErrorClass};
use tern_core::types::{HandlerOutcome, InvocationRequest, IsolationKind, WorkerFailure, WorkerResponse};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tern_core::{HandlerContext, HandlerRegistry, InvocationId};
use tracing::{debug, info, warn};

use crate::channel::WorkerEndpoint;
use crate::process::{self, ChildExit, OutputPipe};
use crate::resource::{ResourceScope, ScopeController, ScopeName};
use crate::worker::{
    reply_failure, IsolationWorker, WorkerReport, WorkerSettings, WorkerStatus,
    EXIT_HANDLER_FAILED, EXIT_JOIN_FAILED, EXIT_UNDELIVERED,
};

/// What the child sends through the result pipe.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
enum ChildReport {
    /// The handler ran.
    Completed { outcome: HandlerOutcome },
    /// The child could not join its scope; the handler never ran.
    JoinFailed { message: String },
}

/// Everything the child needs, captured before fork.
struct ChildJob {
    controller: Arc<dyn ScopeController>,
    scope: ScopeName,
    registry: Arc<HandlerRegistry>,
    function: String,
    arguments: Value,
    context: HandlerContext,
    linger: Duration,
}

impl ChildJob {
    fn run(self, mut pipe: OutputPipe) -> i32 {
        // Join first: everything after this is charged to the scope.
        let pid = std::process::id() as i32;
        if let Err(e) = self.controller.join(&self.scope, pid) {
            let _ = pipe.send(&ChildReport::JoinFailed {
                message: e.to_string(),
            });
            return EXIT_JOIN_FAILED;
        }

        let outcome = self.registry.invoke(&self.function, &self.arguments, &self.context);
        let code = if outcome.is_ok() { 0 } else { EXIT_HANDLER_FAILED };

        if pipe.send(&ChildReport::Completed { outcome }).is_err() {
            return EXIT_UNDELIVERED;
        }
        drop(pipe);

        // The parent terminates us once it has the outcome.
        thread::sleep(self.linger);
        code
    }
}

/// Worker that runs each invocation in a forked child inside its own scope.
#[derive(Debug, Clone)]
pub struct ScaleWorker {
    registry: Arc<HandlerRegistry>,
    controller: Arc<dyn ScopeController>,
    settings: WorkerSettings,
}

impl ScaleWorker {
    /// Create a scale worker.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        controller: Arc<dyn ScopeController>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            controller,
            settings,
        }
    }

    /// The scope backend.
    pub fn controller(&self) -> &Arc<dyn ScopeController> {
        &self.controller
    }

    /// Run the request inside `scope` and produce the response.
    ///
    /// The child is always reaped before this returns.
    fn execute(
        &self,
        request: InvocationRequest,
        scope: &ResourceScope,
        cancel: &CancellationToken,
    ) -> (WorkerResponse, WorkerStatus) {
        let job = ChildJob {
            controller: Arc::clone(&self.controller),
            scope: scope.name().clone(),
            registry: Arc::clone(&self.registry),
            context: HandlerContext::isolated(request.id, &request.context).with_scope(scope.info()),
            function: request.function,
            arguments: request.arguments,
            linger: self.settings.child_linger,
        };

        let mut child = match process::fork_with_output(move |pipe| job.run(pipe)) {
            Ok(child) => child,
            Err(e) => {
                warn!(scope = %scope.name(), error = %e, "Failed to fork scale worker");
                return failed(&e);
            }
        };

        debug!(scope = %scope.name(), pid = child.pid(), "Forked scale child");

        let report = child.read::<ChildReport>(
            Deadline::after(self.settings.invocation_timeout),
            cancel,
        );

        let exit = match &report {
            Ok(_) => child.terminate_and_reap(self.settings.reap_timeout),
            Err(_) => child.kill_and_reap(),
        };
        match &exit {
            Ok(exit) => debug!(scope = %scope.name(), pid = child.pid(), %exit, "Reaped scale child"),
            Err(e) => warn!(scope = %scope.name(), pid = child.pid(), error = %e, "Failed to reap scale child"),
        }

        match report {
            Ok(ChildReport::Completed { outcome }) => {
                let status = if outcome.is_ok() {
                    WorkerStatus::Succeeded
                } else {
                    WorkerStatus::HandlerFailed
                };
                (WorkerResponse::Completed { outcome }, status)
            }
            Ok(ChildReport::JoinFailed { message }) => (
                WorkerResponse::Failed {
                    failure: WorkerFailure::new(ErrorClass::Setup, message),
                },
                WorkerStatus::Failed(ErrorClass::Setup),
            ),
            Err(Error::Timeout(_)) => (
                WorkerResponse::Failed {
                    failure: WorkerFailure::new(
                        ErrorClass::Timeout,
                        format!(
                            "handler exceeded {} ms",
                            self.settings.invocation_timeout.as_millis()
                        ),
                    ),
                },
                WorkerStatus::TimedOut,
            ),
            Err(Error::Channel(ChannelError::Closed(_))) => {
                let status = match exit {
                    Ok(exit) => exit.to_string(),
                    Err(_) => ChildExit::Unknown.to_string(),
                };
                (
                    WorkerResponse::Failed {
                        failure: WorkerFailure::new(
                            ErrorClass::Internal,
                            format!("child exited without a result: {}", status),
                        ),
                    },
                    WorkerStatus::Failed(ErrorClass::Internal),
                )
            }
            Err(e) => failed(&e),
        }
    }
}

fn failed(error: &Error) -> (WorkerResponse, WorkerStatus) {
    (
        WorkerResponse::Failed {
            failure: WorkerFailure::from(error),
        },
        WorkerStatus::Failed(error.class()),
    )
}

impl IsolationWorker for ScaleWorker {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Scale
    }

    fn run(&self, invocation_id: InvocationId, channel: &Path, cancel: &CancellationToken) -> WorkerReport {
        let endpoint = WorkerEndpoint::new(channel);
        let mut report = WorkerReport::new(invocation_id, IsolationKind::Scale, WorkerStatus::Succeeded);

        let request: InvocationRequest =
            match endpoint.receive(Deadline::after(self.settings.handoff_timeout), cancel) {
                Ok(request) => request,
                Err(e) => {
                    warn!(invocation_id = %invocation_id, error = %e, "No request received");
                    report.status = WorkerStatus::Failed(e.class());
                    return report;
                }
            };

        let budget = request.memory_budget;
        let mut scope = match ResourceScope::create(
            Arc::clone(&self.controller),
            budget,
            self.settings.teardown,
        ) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(invocation_id = %invocation_id, error = %e, "Failed to create resource scope");
                reply_failure(&endpoint, WorkerFailure::from(&e), self.settings.reply_timeout);
                report.status = WorkerStatus::Failed(e.class());
                return report;
            }
        };

        let (response, status) = self.execute(request, &scope, cancel);

        if scope.teardown().is_err() {
            report.scope_leaked = true;
        }

        info!(
            invocation_id = %invocation_id,
            scope = %scope.name(),
            budget = %budget,
            %status,
            "Scale invocation finished"
        );

        let delivered = endpoint.reply(
            &response,
            Deadline::after(self.settings.reply_timeout),
            &CancellationToken::new(),
        );
        if let Err(e) = delivered {
            warn!(invocation_id = %invocation_id, error = %e, "Response not delivered");
        }

        report.status = status;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_report_encoding() {
        let report = ChildReport::Completed {
            outcome: HandlerOutcome::ok(serde_json::json!([1.0, 2.0])),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["report"], "completed");
        assert_eq!(json["outcome"]["status"], "ok");

        let report: ChildReport =
            serde_json::from_str(r#"{"report":"join_failed","message":"EACCES"}"#).unwrap();
        assert!(matches!(report, ChildReport::JoinFailed { ref message } if message == "EACCES"));
    }
}
