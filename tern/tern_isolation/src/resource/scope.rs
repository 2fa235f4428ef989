//! Resource scope lifecycle.
//!
//! `ResourceScope` owns one scope from creation to removal. Removal is
//! retried with exponential backoff because the backend refuses it while a
//! terminated member is still being torn down.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tern_core::error::{Error, Result, ScopeError, SetupError};
use tern_core::types::{MemoryBudget, ScopeInfo};
use tracing::{debug, error, info, warn};

use crate::naming::random_token;
use crate::resource::controller::ScopeController;

/// Length of generated scope names.
pub const SCOPE_NAME_LEN: usize = 8;

/// Names tried before a creation collision is reported.
const NAME_ATTEMPTS: usize = 3;

/// A validated scope name: one safe path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeName(String);

impl ScopeName {
    /// Validate a scope name.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, ScopeError> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
        {
            return Err(ScopeError::InvalidName(name));
        }
        Ok(Self(name))
    }

    /// A fresh random name of eight alphanumeric characters.
    pub fn random() -> Self {
        Self(random_token(SCOPE_NAME_LEN))
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScopeName {
    type Err = ScopeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Backoff schedule for scope removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum removal attempts.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,

    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Sum of every delay a teardown that exhausts its attempts sleeps.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, |total, delay| total.saturating_add(delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// An owned resource scope.
///
/// Dropping a scope that was not torn down runs the teardown.
pub struct ResourceScope {
    name: ScopeName,
    path: PathBuf,
    controller: Arc<dyn ScopeController>,
    retry: RetryPolicy,
    removed: bool,
}

impl ResourceScope {
    /// Create a scope with a random name and write its budget.
    ///
    /// # Arguments
    ///
    /// * `controller` - The backend to create the scope with.
    /// * `budget` - The memory budget written to the size entry.
    /// * `retry` - Removal schedule used by `teardown`.
    ///
    /// # Returns
    ///
    /// * `Err(Error::Setup)` - Creation or configuration failed. Nothing is
    ///   left behind.
    pub fn create(
        controller: Arc<dyn ScopeController>,
        budget: MemoryBudget,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::create_named(Arc::clone(&controller), ScopeName::random(), budget, retry) {
                Err(Error::Setup(SetupError::ScopeCreate { ref source, ref path }))
                    if source.kind() == io::ErrorKind::AlreadyExists && attempt < NAME_ATTEMPTS =>
                {
                    debug!(path = %path.display(), "Scope name collision, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Create a scope with an explicit name and write its budget.
    pub fn create_named(
        controller: Arc<dyn ScopeController>,
        name: ScopeName,
        budget: MemoryBudget,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let path = controller.create(&name)?;

        if let Err(e) = controller.set_budget(&name, budget) {
            if let Err(remove_err) = controller.remove(&name) {
                warn!(scope = %name, error = %remove_err, "Failed to remove unconfigured scope");
            }
            return Err(e);
        }

        info!(
            scope = %name,
            path = %path.display(),
            budget = %budget,
            backend = controller.kind(),
            "Created resource scope"
        );

        Ok(Self {
            name,
            path,
            controller,
            retry,
            removed: false,
        })
    }

    /// The scope's name.
    pub fn name(&self) -> &ScopeName {
        &self.name
    }

    /// The scope's directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backend that owns this scope.
    pub fn controller(&self) -> &Arc<dyn ScopeController> {
        &self.controller
    }

    /// Where a handler can find this scope.
    pub fn info(&self) -> ScopeInfo {
        ScopeInfo {
            name: self.name.to_string(),
            path: self.path.clone(),
            size_control: self
                .controller
                .control_path(&self.name, &self.controller.control_files().size),
        }
    }

    /// Read the budget back from the size entry.
    pub fn budget(&self) -> Result<MemoryBudget> {
        self.controller.budget(&self.name)
    }

    /// Live member process ids.
    pub fn members(&self) -> Result<Vec<i32>> {
        self.controller.members(&self.name)
    }

    /// Move `pid` into the scope.
    pub fn join(&self, pid: i32) -> Result<()> {
        self.controller.join(&self.name, pid)
    }

    /// Write the reclaim trigger.
    pub fn reclaim(&self) -> Result<()> {
        self.controller.reclaim(&self.name)
    }

    /// Whether the scope was removed.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Remove the scope, retrying while it is busy.
    ///
    /// # Returns
    ///
    /// * `Ok(attempts)` - The scope is gone.
    /// * `Err(ScopeError::Teardown)` - It could not be removed within the
    ///   retry budget. The failure has been logged.
    pub fn teardown(&mut self) -> Result<u32> {
        if self.removed {
            return Ok(0);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.controller.remove(&self.name) {
                Ok(()) => {
                    self.removed = true;
                    debug!(scope = %self.name, attempts = attempt, "Tore down resource scope");
                    return Ok(attempt);
                }
                Err(e) => {
                    debug!(scope = %self.name, attempt, error = %e, "Scope removal failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        thread::sleep(self.retry.backoff(attempt));
                    }
                }
            }
        }

        error!(
            scope = %self.name,
            path = %self.path.display(),
            attempts = max_attempts,
            error = %last_error,
            "Resource scope leaked"
        );

        Err(ScopeError::Teardown {
            name: self.name.to_string(),
            attempts: max_attempts,
            reason: last_error,
        }
        .into())
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScope")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("backend", &self.controller.kind())
            .field("removed", &self.removed)
            .finish()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if !self.removed {
            // Failures are logged by teardown.
            let _ = self.teardown();
        }
    }
}
