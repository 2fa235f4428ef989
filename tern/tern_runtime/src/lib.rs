//! Tern Runtime - function dispatch with process and scope isolation
//!
//! This crate provides the runtime components for tern: configuration,
//! the supervisor that turns queued work into isolated workers, the
//! dispatcher that routes calls by function name, built-in functions and
//! the system bootstrap/shutdown sequence.

pub mod dispatcher;
pub mod functions;
pub mod report;
pub mod supervisor;
pub mod system;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tern_core::types::{HandlerOutcome, InvocationContext, MemoryBudget};
use tern_core::utils::deadline::CancellationToken;
use tern_core::HandlerRegistry;
use tern_isolation::ScopeController;
use tracing::info;

pub use dispatcher::{Dispatcher, FunctionName};
pub use report::InvocationReport;
pub use supervisor::{Supervisor, SupervisorStats, WorkItem, WorkQueue};
pub use system::config::RuntimeConfig;

/// Runtime facade that provides a unified interface to the tern runtime.
pub struct Runtime {
    /// System component for bootstrap and shutdown
    system: system::bootstrap::System,

    /// Registry shared by the dispatcher and every worker
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    /// Create and start a runtime serving `registry`
    pub fn new(config: RuntimeConfig, registry: HandlerRegistry) -> Result<Self> {
        info!("Initializing tern runtime");

        let registry = Arc::new(registry);
        let mut system = system::bootstrap::System::new(config)?;
        system.bootstrap(Arc::clone(&registry))?;

        info!(functions = registry.len(), "Tern runtime started");
        Ok(Self { system, registry })
    }

    /// Create and start a runtime serving the built-in functions
    pub fn with_builtins(config: RuntimeConfig) -> Result<Self> {
        Self::new(config, functions::builtin_registry())
    }

    /// The effective configuration
    pub fn config(&self) -> &RuntimeConfig {
        self.system.config()
    }

    /// The handler registry
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// The dispatcher; clone it to invoke from other threads
    pub fn dispatcher(&self) -> Result<&Dispatcher> {
        self.system.dispatcher()
    }

    /// The scope backend used by scale invocations
    pub fn controller(&self) -> Result<Arc<dyn ScopeController>> {
        self.system.controller()
    }

    /// Invoke a function with the configured default budget
    pub fn invoke(&self, function_name: &str, arguments: Value, context: InvocationContext) -> Result<HandlerOutcome> {
        Ok(self.dispatcher()?.invoke(function_name, arguments, context)?)
    }

    /// Invoke a function with an explicit memory budget
    pub fn invoke_with_budget(
        &self,
        function_name: &str,
        arguments: Value,
        budget: MemoryBudget,
        context: InvocationContext,
    ) -> Result<HandlerOutcome> {
        Ok(self
            .dispatcher()?
            .invoke_with_budget(function_name, arguments, budget, context)?)
    }

    /// Invoke a function that can be abandoned through `cancel`
    pub fn invoke_with_cancel(
        &self,
        function_name: &str,
        arguments: Value,
        budget: MemoryBudget,
        context: InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome> {
        Ok(self
            .dispatcher()?
            .invoke_with_cancel(function_name, arguments, budget, context, cancel)?)
    }

    /// Supervisor counters
    pub fn stats(&self) -> Result<SupervisorStats> {
        Ok(self.system.supervisor()?.stats())
    }

    /// Gracefully shut down the runtime
    pub fn shutdown(mut self) -> Result<SupervisorStats> {
        info!("Shutting down tern runtime");
        let stats = self.system.shutdown()?;
        info!("Tern runtime shut down successfully");
        Ok(stats)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("phase", &self.system.phase())
            .field("registry", &self.registry)
            .finish()
    }
}
