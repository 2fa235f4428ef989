//! Scope controller.
//!
//! A scope controller owns the root directory scopes are created under and
//! knows how its backend treats the control entries.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tern_core::error::{Result, ScopeError, SetupError};
use tern_core::types::MemoryBudget;

use crate::resource::scope::ScopeName;

/// Value written to the reclaim entry.
pub const RECLAIM_TRIGGER: &str = "1";

/// Names of the control entries inside a scope directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlFiles {
    /// Memory budget entry, written as `<n>M`.
    pub size: String,

    /// Membership entry, written with a process id.
    pub procs: String,

    /// Reclaim entry, written with `1`.
    pub free: String,
}

impl Default for ControlFiles {
    fn default() -> Self {
        Self {
            size: "memory.faascale.size".to_string(),
            procs: "cgroup.procs".to_string(),
            free: "memory.faascale.free".to_string(),
        }
    }
}

/// A backend that creates, configures and removes resource scopes.
///
/// Implementations must be usable from a forked child: `join` may not take
/// locks or log.
pub trait ScopeController: Send + Sync + fmt::Debug {
    /// The directory scopes are created under.
    fn root(&self) -> &Path;

    /// Names of the control entries.
    fn control_files(&self) -> &ControlFiles;

    /// Short backend name, for logs.
    fn kind(&self) -> &'static str;

    /// Directory of the named scope.
    fn scope_path(&self, name: &ScopeName) -> PathBuf {
        self.root().join(name.as_str())
    }

    /// Path of one control entry of the named scope.
    fn control_path(&self, name: &ScopeName, entry: &str) -> PathBuf {
        self.scope_path(name).join(entry)
    }

    /// Create the scope directory. Fails if it already exists.
    fn create(&self, name: &ScopeName) -> Result<PathBuf>;

    /// Write the memory budget.
    ///
    /// # Returns
    ///
    /// * `Err(SetupError::ScopeConfigure)` - The entry could not be written.
    fn set_budget(&self, name: &ScopeName, budget: MemoryBudget) -> Result<()> {
        let entry = &self.control_files().size;
        fs::write(self.control_path(name, entry), budget.to_control_string()).map_err(|source| {
            SetupError::ScopeConfigure {
                path: self.scope_path(name),
                entry: entry.clone(),
                source,
            }
            .into()
        })
    }

    /// Read the memory budget back.
    fn budget(&self, name: &ScopeName) -> Result<MemoryBudget> {
        let entry = &self.control_files().size;
        let raw = fs::read_to_string(self.control_path(name, entry)).map_err(|source| {
            ScopeError::Control {
                name: name.to_string(),
                entry: entry.clone(),
                source,
            }
        })?;
        Ok(raw.parse::<MemoryBudget>()?)
    }

    /// Move process `pid` into the scope.
    fn join(&self, name: &ScopeName, pid: i32) -> Result<()>;

    /// Process ids currently in the scope.
    fn members(&self, name: &ScopeName) -> Result<Vec<i32>>;

    /// Ask the backend to give the scope's memory back.
    fn reclaim(&self, name: &ScopeName) -> Result<()> {
        let entry = &self.control_files().free;
        fs::write(self.control_path(name, entry), RECLAIM_TRIGGER).map_err(|source| {
            ScopeError::Control {
                name: name.to_string(),
                entry: entry.clone(),
                source,
            }
            .into()
        })
    }

    /// Remove the scope directory.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The scope is gone, or never existed.
    /// * `Err(ScopeError::Busy)` - The scope still has live members.
    fn remove(&self, name: &ScopeName) -> Result<()>;
}

/// Parse a membership entry: one process id per line.
pub(crate) fn parse_members(raw: &str) -> Vec<i32> {
    raw.lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}
