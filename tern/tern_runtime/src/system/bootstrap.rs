//! System bootstrap for the tern runtime
//!
//! Brings the runtime up in phases: directories first, then the scope
//! controller, then the workers, the supervisor and the dispatcher on top.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tern_core::HandlerRegistry;
use tern_isolation::{
    BalloonWorker, CgroupController, DirectoryController, ScaleWorker, ScopeController,
};
use thiserror::Error;
use tracing::{info, warn};

use super::config::{RuntimeConfig, ScopeBackend, ScopeConfig};
use crate::dispatcher::Dispatcher;
use crate::supervisor::{Supervisor, SupervisorStats, WorkerSet};

/// Errors that can occur during bootstrap
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Phase {0} bootstrap failed: {1}")]
    PhaseFailed(u8, String),

    #[error("System already bootstrapped")]
    AlreadyBootstrapped,

    #[error("Dependency {0} not initialized")]
    DependencyNotInitialized(String),
}

/// Bootstrap phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    /// Phase 0: Directories
    Core = 0,

    /// Phase 1: Scope controller
    Isolation = 1,

    /// Phase 2: Workers, supervisor and dispatcher
    Dispatch = 2,

    /// System is fully bootstrapped
    Complete = 3,
}

/// State of the system
pub struct System {
    /// System configuration
    config: RuntimeConfig,

    /// Current bootstrap phase
    phase: BootstrapPhase,

    /// Scope backend for scale invocations
    controller: Option<Arc<dyn ScopeController>>,

    /// Consumer of the dispatch queue
    supervisor: Option<Supervisor>,

    /// Entry point for invocations
    dispatcher: Option<Dispatcher>,
}

impl System {
    /// Create a new system
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            phase: BootstrapPhase::Core,
            controller: None,
            supervisor: None,
            dispatcher: None,
        })
    }

    /// Bootstrap the system
    pub fn bootstrap(&mut self, registry: Arc<HandlerRegistry>) -> Result<()> {
        if self.phase != BootstrapPhase::Core {
            return Err(BootstrapError::AlreadyBootstrapped.into());
        }
        info!("Starting system bootstrap");

        self.bootstrap_phase_0()?;
        self.bootstrap_phase_1()?;
        self.bootstrap_phase_2(registry)?;

        self.phase = BootstrapPhase::Complete;
        info!("System bootstrap complete");
        Ok(())
    }

    /// Phase 0: create the channel directory
    fn bootstrap_phase_0(&mut self) -> Result<()> {
        info!("Bootstrap Phase 0: Core system setup");

        let channel_dir = &self.config.dispatch.channel_dir;
        fs::create_dir_all(channel_dir).with_context(|| {
            format!("Failed to create channel directory: {}", channel_dir.display())
        })?;

        Ok(())
    }

    /// Phase 1: scope controller
    fn bootstrap_phase_1(&mut self) -> Result<()> {
        info!("Bootstrap Phase 1: Scope controller");
        self.phase = BootstrapPhase::Isolation;

        let controller = build_controller(&self.config.scope)
            .map_err(|e| BootstrapError::PhaseFailed(1, format!("{:#}", e)))?;
        self.controller = Some(controller);

        Ok(())
    }

    /// Phase 2: workers, supervisor and dispatcher
    fn bootstrap_phase_2(&mut self, registry: Arc<HandlerRegistry>) -> Result<()> {
        info!("Bootstrap Phase 2: Workers and dispatch");
        self.phase = BootstrapPhase::Dispatch;

        let controller = self.controller()?;
        let settings = self.config.worker_settings();
        let workers = WorkerSet {
            balloon: Arc::new(BalloonWorker::new(Arc::clone(&registry), settings)),
            scale: Arc::new(ScaleWorker::new(Arc::clone(&registry), controller, settings)),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &self.config.supervisor)
            .map_err(|e| BootstrapError::PhaseFailed(2, e.to_string()))?;
        let dispatcher = Dispatcher::new(registry, queue, &self.config.dispatch)
            .map_err(|e| BootstrapError::PhaseFailed(2, e.to_string()))?;

        self.supervisor = Some(supervisor);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// The configuration the system was built from
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current bootstrap phase
    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    /// Get the scope controller
    pub fn controller(&self) -> Result<Arc<dyn ScopeController>> {
        self.controller.clone().ok_or_else(|| {
            BootstrapError::DependencyNotInitialized("ScopeController".to_string()).into()
        })
    }

    /// Get the dispatcher
    pub fn dispatcher(&self) -> Result<&Dispatcher> {
        self.dispatcher.as_ref().ok_or_else(|| {
            BootstrapError::DependencyNotInitialized("Dispatcher".to_string()).into()
        })
    }

    /// Get the supervisor
    pub fn supervisor(&self) -> Result<&Supervisor> {
        self.supervisor.as_ref().ok_or_else(|| {
            BootstrapError::DependencyNotInitialized("Supervisor".to_string()).into()
        })
    }

    /// Shut down the system
    ///
    /// Drops the dispatcher's queue handle, then stops the supervisor and
    /// waits for in-flight workers.
    pub fn shutdown(&mut self) -> Result<SupervisorStats> {
        info!("Shutting down system");

        self.dispatcher = None;
        let stats = match self.supervisor.take() {
            Some(supervisor) => supervisor.shutdown(self.config.supervisor.shutdown_timeout()),
            None => {
                warn!("Supervisor not initialized, nothing to shut down");
                SupervisorStats::default()
            }
        };

        info!("System shutdown complete");
        Ok(stats)
    }
}

/// Build the scope controller selected by `config`
pub fn build_controller(config: &ScopeConfig) -> Result<Arc<dyn ScopeController>> {
    let files = config.control_files.clone();
    let controller: Arc<dyn ScopeController> = match config.backend {
        ScopeBackend::Cgroup => {
            let controller = CgroupController::new(&config.root, files);
            if !controller.is_available() {
                warn!(
                    root = %config.root.display(),
                    "Cgroup scope root not available, scale invocations will fail at setup"
                );
            }
            Arc::new(controller)
        }
        ScopeBackend::Directory => Arc::new(
            DirectoryController::new(&config.root, files).with_context(|| {
                format!("Failed to prepare scope root: {}", config.root.display())
            })?,
        ),
    };

    info!(
        backend = controller.kind(),
        root = %controller.root().display(),
        "Scope controller ready"
    );
    Ok(controller)
}
