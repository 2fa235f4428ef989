//! Configuration for the tern runtime
//!
//! Handles loading and validating runtime configuration. Every field has a
//! default, so an empty or partial TOML file is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tern_core::types::MemoryBudget;
use tern_core::utils::logging::LogLevel;
use tern_isolation::{ControlFiles, RetryPolicy, WorkerSettings};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Directory SyncChannel files are created in
    #[serde(default = "default_channel_dir")]
    pub channel_dir: PathBuf,

    /// How long a caller waits for a worker to take its request (milliseconds)
    #[serde(default = "default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,

    /// Bound on handler execution in isolated workers (milliseconds)
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,

    /// Extra time a caller waits beyond the invocation timeout (milliseconds)
    #[serde(default = "default_response_grace_ms")]
    pub response_grace_ms: u64,

    /// Memory budget used when the caller does not give one (MiB)
    #[serde(default = "default_memory_mib")]
    pub default_memory_mib: u64,
}

fn default_channel_dir() -> PathBuf {
    std::env::temp_dir().join("tern")
}

fn default_handoff_timeout_ms() -> u64 {
    5_000
}

fn default_invocation_timeout_ms() -> u64 {
    60_000
}

fn default_response_grace_ms() -> u64 {
    10_000
}

fn default_memory_mib() -> u64 {
    128
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_dir: default_channel_dir(),
            handoff_timeout_ms: default_handoff_timeout_ms(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            response_grace_ms: default_response_grace_ms(),
            default_memory_mib: default_memory_mib(),
        }
    }
}

impl DispatchConfig {
    /// Hand-off phase bound.
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    /// Handler execution bound.
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// Response phase bound, as seen by the caller.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms.saturating_add(self.response_grace_ms))
    }

    /// The default memory budget.
    pub fn default_budget(&self) -> Result<MemoryBudget> {
        MemoryBudget::from_mib(self.default_memory_mib)
            .context("dispatch.default_memory_mib must be positive")
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Dispatch queue capacity; 0 means unbounded
    #[serde(default)]
    pub queue_capacity: usize,

    /// Maximum number of workers running at once
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,

    /// How long shutdown waits for in-flight workers (milliseconds)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_max_concurrent_workers() -> usize {
    4 * num_cpus::get()
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 0,
            max_concurrent_workers: default_max_concurrent_workers(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SupervisorConfig {
    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Resource scope backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeBackend {
    /// Kernel memory cgroup hierarchy
    Cgroup,

    /// Plain directories emulating the control entries
    Directory,
}

/// Resource scope configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Scope backend
    #[serde(default = "default_backend")]
    pub backend: ScopeBackend,

    /// Directory scopes are created under
    #[serde(default = "default_scope_root")]
    pub root: PathBuf,

    /// Names of the control entries
    #[serde(default)]
    pub control_files: ControlFiles,

    /// How long a scale child lingers after delivering its result (milliseconds)
    #[serde(default = "default_child_linger_ms")]
    pub child_linger_ms: u64,

    /// Grace period between SIGTERM and SIGKILL (milliseconds)
    #[serde(default = "default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,

    /// Scope removal attempts
    #[serde(default = "default_teardown_attempts")]
    pub teardown_attempts: u32,

    /// Delay after the first failed removal (milliseconds)
    #[serde(default = "default_teardown_backoff_ms")]
    pub teardown_backoff_ms: u64,

    /// Upper bound on the removal delay (milliseconds)
    #[serde(default = "default_teardown_max_backoff_ms")]
    pub teardown_max_backoff_ms: u64,
}

fn default_backend() -> ScopeBackend {
    ScopeBackend::Cgroup
}

fn default_scope_root() -> PathBuf {
    PathBuf::from(tern_isolation::resource::DEFAULT_CGROUP_ROOT)
}

fn default_child_linger_ms() -> u64 {
    10_000
}

fn default_reap_timeout_ms() -> u64 {
    2_000
}

fn default_teardown_attempts() -> u32 {
    10
}

fn default_teardown_backoff_ms() -> u64 {
    10
}

fn default_teardown_max_backoff_ms() -> u64 {
    500
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_scope_root(),
            control_files: ControlFiles::default(),
            child_linger_ms: default_child_linger_ms(),
            reap_timeout_ms: default_reap_timeout_ms(),
            teardown_attempts: default_teardown_attempts(),
            teardown_backoff_ms: default_teardown_backoff_ms(),
            teardown_max_backoff_ms: default_teardown_max_backoff_ms(),
        }
    }
}

impl ScopeConfig {
    /// Scope removal schedule.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.teardown_attempts,
            initial_backoff: Duration::from_millis(self.teardown_backoff_ms),
            max_backoff: Duration::from_millis(self.teardown_max_backoff_ms),
        }
    }

    /// Worst case between giving up on a child and the scope being gone:
    /// the reap grace plus every teardown backoff.
    pub fn cleanup_budget(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms).saturating_add(self.retry_policy().total_backoff())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Resource scope configuration
    #[serde(default)]
    pub scope: ScopeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file is not an error: the defaults are used and a warning
    /// is logged.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());

                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    RuntimeConfig::default()
                } else {
                    let content = fs::read_to_string(path).with_context(|| {
                        format!("Failed to read configuration file: {}", path.display())
                    })?;
                    Self::from_toml(&content).with_context(|| {
                        format!("Failed to parse configuration file: {}", path.display())
                    })?
                }
            }
            None => {
                info!("No configuration file specified, using defaults");
                RuntimeConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.channel_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Channel directory cannot be empty".to_string()).into());
        }

        if self.dispatch.handoff_timeout_ms == 0 || self.dispatch.invocation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Dispatch timeouts cannot be zero".to_string()).into());
        }

        if self.dispatch.default_memory_mib == 0 {
            return Err(
                ConfigError::Invalid("Default memory budget cannot be zero".to_string()).into(),
            );
        }

        if self.supervisor.max_concurrent_workers == 0 {
            return Err(
                ConfigError::Invalid("Max concurrent workers cannot be zero".to_string()).into(),
            );
        }

        if self.scope.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Scope root cannot be empty".to_string()).into());
        }

        let files = &self.scope.control_files;
        for entry in [&files.size, &files.procs, &files.free] {
            if entry.is_empty() || entry.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "Control entry must be a plain file name: {:?}",
                    entry
                ))
                .into());
            }
        }

        if self.scope.teardown_attempts == 0 {
            return Err(ConfigError::Invalid("Teardown attempts cannot be zero".to_string()).into());
        }

        // The grace is also the worker's reply deadline. It has to outlast
        // cleanup or a timed-out caller never hears why.
        if self.dispatch.response_grace_ms == 0 {
            return Err(ConfigError::Invalid("Response grace cannot be zero".to_string()).into());
        }
        let cleanup = self.scope.cleanup_budget();
        if Duration::from_millis(self.dispatch.response_grace_ms) < cleanup {
            return Err(ConfigError::Invalid(format!(
                "Response grace ({} ms) must cover reaping and scope teardown ({} ms)",
                self.dispatch.response_grace_ms,
                cleanup.as_millis()
            ))
            .into());
        }

        if self.scope.child_linger_ms > self.dispatch.invocation_timeout_ms {
            warn!(
                "Child linger ({} ms) exceeds the invocation timeout ({} ms)",
                self.scope.child_linger_ms, self.dispatch.invocation_timeout_ms
            );
        }

        Ok(())
    }

    /// Timing settings for isolated workers
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            handoff_timeout: self.dispatch.handoff_timeout(),
            invocation_timeout: self.dispatch.invocation_timeout(),
            reply_timeout: Duration::from_millis(self.dispatch.response_grace_ms),
            child_linger: Duration::from_millis(self.scope.child_linger_ms),
            reap_timeout: Duration::from_millis(self.scope.reap_timeout_ms),
            teardown: self.scope.retry_policy(),
        }
    }
}
