//! Dispatcher.
//!
//! Decides from the function name whether a call runs directly or in an
//! isolated worker. Isolated calls get a fresh SyncChannel, a work item on
//! the supervisor's queue, and two bounded waits: one for a worker to take
//! the request and one for its response.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tern_core::error::Result;
use tern_core::types::{
    HandlerOutcome, InvocationContext, InvocationRequest, IsolationKind, MemoryBudget,
    WorkerResponse,
};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tern_core::{HandlerContext, HandlerRegistry, InvocationId};
use tern_isolation::SyncChannel;
use tracing::{debug, info, info_span, trace};

use crate::supervisor::{WorkItem, WorkQueue};
use crate::system::config::DispatchConfig;

/// A function name split into its isolation kind and bare name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionName {
    kind: IsolationKind,
    bare: String,
}

impl FunctionName {
    /// Parse a function name. Names without a recognised suffix run directly.
    pub fn parse(name: &str) -> Self {
        let (kind, bare) = IsolationKind::split(name);
        Self {
            kind,
            bare: bare.to_string(),
        }
    }

    /// The isolation kind selected by the suffix.
    pub fn kind(&self) -> IsolationKind {
        self.kind
    }

    /// The name the handler is registered under.
    pub fn bare(&self) -> &str {
        &self.bare
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bare)?;
        if let Some(suffix) = self.kind.suffix() {
            f.write_str(suffix)?;
        }
        Ok(())
    }
}

/// Routes invocations to the registry or to the supervisor.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    queue: WorkQueue,
    channel_dir: PathBuf,
    handoff_timeout: Duration,
    response_timeout: Duration,
    default_budget: MemoryBudget,
}

impl Dispatcher {
    /// Create a dispatcher feeding `queue`.
    pub fn new(registry: Arc<HandlerRegistry>, queue: WorkQueue, config: &DispatchConfig) -> Result<Self> {
        Ok(Self {
            registry,
            queue,
            channel_dir: config.channel_dir.clone(),
            handoff_timeout: config.handoff_timeout(),
            response_timeout: config.response_timeout(),
            default_budget: MemoryBudget::from_mib(config.default_memory_mib)?,
        })
    }

    /// Directory SyncChannels are created in.
    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    /// The handler registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Invoke a function with the default memory budget.
    pub fn invoke(&self, function_name: &str, arguments: Value, context: InvocationContext) -> Result<HandlerOutcome> {
        self.invoke_with_budget(function_name, arguments, self.default_budget, context)
    }

    /// Invoke a function with an explicit memory budget.
    pub fn invoke_with_budget(
        &self,
        function_name: &str,
        arguments: Value,
        budget: MemoryBudget,
        context: InvocationContext,
    ) -> Result<HandlerOutcome> {
        self.invoke_with_cancel(function_name, arguments, budget, context, &CancellationToken::new())
    }

    /// Invoke a function.
    ///
    /// # Arguments
    ///
    /// * `function_name` - Name, optionally ending in an isolation suffix.
    /// * `arguments` - Opaque payload passed to the handler.
    /// * `budget` - Memory budget; only scale invocations enforce it.
    /// * `context` - Store endpoint and credential.
    /// * `cancel` - Abandons the waits when cancelled.
    ///
    /// # Returns
    ///
    /// * `Ok(HandlerOutcome)` - The handler ran; it may still have failed.
    /// * `Err(Error)` - The infrastructure failed. The channel is removed
    ///   in every case.
    pub fn invoke_with_cancel(
        &self,
        function_name: &str,
        arguments: Value,
        budget: MemoryBudget,
        context: InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome> {
        let name = FunctionName::parse(function_name);

        if !name.kind().is_isolated() {
            trace!(function = name.bare(), "Direct invocation");
            let ctx = HandlerContext::direct(&context);
            return Ok(self.registry.invoke(name.bare(), &arguments, &ctx));
        }

        let request = InvocationRequest {
            id: InvocationId::new(),
            function: name.bare().to_string(),
            arguments,
            memory_budget: budget,
            kind: name.kind(),
            context,
        };

        let span = info_span!(
            "invocation",
            invocation_id = %request.id,
            kind = %request.kind,
            function = %request.function
        );
        let _enter = span.enter();

        self.dispatch_isolated(&request, cancel)
    }

    fn dispatch_isolated(&self, request: &InvocationRequest, cancel: &CancellationToken) -> Result<HandlerOutcome> {
        let started = Instant::now();
        let handoff = Deadline::after(self.handoff_timeout);

        let channel = SyncChannel::create(&self.channel_dir)?;
        debug!(channel = %channel.path().display(), "Created sync channel");

        self.queue
            .submit(WorkItem::new(request.kind, channel.path(), request.id), handoff)?;

        let reader = channel.send(request, handoff, cancel)?;
        let response: WorkerResponse = reader.receive(Deadline::after(self.response_timeout), cancel)?;
        drop(channel);

        let outcome = response.into_outcome();
        info!(
            budget = %request.memory_budget,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = matches!(outcome, Ok(ref o) if o.is_ok()),
            "Isolated invocation returned"
        );
        outcome
    }
}
