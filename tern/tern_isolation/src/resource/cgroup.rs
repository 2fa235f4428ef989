//! Kernel cgroup backend.
//!
//! Scopes are directories in a memory cgroup hierarchy whose kernel exposes
//! the faascale control entries. The kernel populates new directories with
//! their control entries and refuses to remove a directory that still has
//! member tasks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tern_core::error::{Result, ScopeError, SetupError};
use tracing::debug;

use crate::resource::controller::{parse_members, ControlFiles, ScopeController};
use crate::resource::scope::ScopeName;

/// Default root of the faascale cgroup hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/memory/faascale";

/// Scope controller for a mounted memory cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
    files: ControlFiles,
}

impl CgroupController {
    /// Create a controller for the hierarchy rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, files: ControlFiles) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    /// Whether the root exists and carries the membership entry.
    pub fn is_available(&self) -> bool {
        self.root.join(&self.files.procs).exists()
    }
}

impl Default for CgroupController {
    fn default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT, ControlFiles::default())
    }
}

impl ScopeController for CgroupController {
    fn root(&self) -> &Path {
        &self.root
    }

    fn control_files(&self) -> &ControlFiles {
        &self.files
    }

    fn kind(&self) -> &'static str {
        "cgroup"
    }

    fn create(&self, name: &ScopeName) -> Result<PathBuf> {
        let path = self.scope_path(name);
        fs::create_dir(&path).map_err(|source| SetupError::ScopeCreate {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn join(&self, name: &ScopeName, pid: i32) -> Result<()> {
        fs::write(self.control_path(name, &self.files.procs), pid.to_string()).map_err(|source| {
            ScopeError::Join {
                name: name.to_string(),
                pid,
                source,
            }
            .into()
        })
    }

    fn members(&self, name: &ScopeName) -> Result<Vec<i32>> {
        match fs::read_to_string(self.control_path(name, &self.files.procs)) {
            Ok(raw) => Ok(parse_members(&raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(ScopeError::Control {
                name: name.to_string(),
                entry: self.files.procs.clone(),
                source,
            }
            .into()),
        }
    }

    fn remove(&self, name: &ScopeName) -> Result<()> {
        let path = self.scope_path(name);
        match fs::remove_dir(&path) {
            Ok(()) => {
                debug!(scope = %name, path = %path.display(), "Removed cgroup scope");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => Err(ScopeError::Busy {
                name: name.to_string(),
                members: self.members(name).map(|m| m.len()).unwrap_or(0),
            }
            .into()),
            Err(source) => Err(ScopeError::Control {
                name: name.to_string(),
                entry: ".".to_string(),
                source,
            }
            .into()),
        }
    }
}
