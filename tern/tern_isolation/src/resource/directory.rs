//! Plain-directory backend.
//!
//! Emulates the cgroup backend on an ordinary filesystem. Control entries
//! are regular files, membership is appended to the membership entry and a
//! scope cannot be removed while any recorded member is still alive.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tern_core::error::{Result, ScopeError, SetupError};
use tracing::debug;

use crate::resource::controller::{parse_members, ControlFiles, ScopeController};
use crate::resource::scope::ScopeName;

/// Scope controller backed by ordinary directories.
#[derive(Debug, Clone)]
pub struct DirectoryController {
    root: PathBuf,
    files: ControlFiles,
}

impl DirectoryController {
    /// Create a controller rooted at `root`, creating the root if needed.
    pub fn new(root: impl Into<PathBuf>, files: ControlFiles) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| SetupError::ScopeCreate {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root, files })
    }

    /// Every member recorded in the scope, alive or not.
    pub fn recorded_members(&self, name: &ScopeName) -> Result<Vec<i32>> {
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
}

fn is_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl ScopeController for DirectoryController {
    fn root(&self) -> &Path {
        &self.root
    }

    fn control_files(&self) -> &ControlFiles {
        &self.files
    }

    fn kind(&self) -> &'static str {
        "directory"
    }

    fn create(&self, name: &ScopeName) -> Result<PathBuf> {
        let path = self.scope_path(name);
        fs::create_dir(&path).map_err(|source| SetupError::ScopeCreate {
            path: path.clone(),
            source,
        })?;
        fs::write(path.join(&self.files.procs), "").map_err(|source| SetupError::ScopeConfigure {
            path: path.clone(),
            entry: self.files.procs.clone(),
            source,
        })?;
        Ok(path)
    }

    fn join(&self, name: &ScopeName, pid: i32) -> Result<()> {
        OpenOptions::new()
            .append(true)
            .open(self.control_path(name, &self.files.procs))
            .and_then(|mut file| writeln!(file, "{}", pid))
            .map_err(|source| {
                ScopeError::Join {
                    name: name.to_string(),
                    pid,
                    source,
                }
                .into()
            })
    }

    fn members(&self, name: &ScopeName) -> Result<Vec<i32>> {
        Ok(self
            .recorded_members(name)?
            .into_iter()
            .filter(|pid| is_alive(*pid))
            .collect())
    }

    fn remove(&self, name: &ScopeName) -> Result<()> {
        let live = self.members(name)?;
        if !live.is_empty() {
            return Err(ScopeError::Busy {
                name: name.to_string(),
                members: live.len(),
            }
            .into());
        }

        let path = self.scope_path(name);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(scope = %name, path = %path.display(), "Removed directory scope");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ScopeError::Control {
                name: name.to_string(),
                entry: ".".to_string(),
                source,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::error::Error;
    use tern_core::types::MemoryBudget;

    fn controller() -> (tempfile::TempDir, DirectoryController) {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            DirectoryController::new(dir.path().join("faascale"), ControlFiles::default()).unwrap();
        (dir, controller)
    }

    #[test]
    fn test_budget_round_trip() {
        let (_dir, controller) = controller();
        let name = ScopeName::new("budget01").unwrap();
        controller.create(&name).unwrap();

        controller
            .set_budget(&name, MemoryBudget::from_mib(128).unwrap())
            .unwrap();
        let raw = fs::read_to_string(controller.control_path(&name, "memory.faascale.size")).unwrap();
        assert_eq!(raw, "128M");
        assert_eq!(controller.budget(&name).unwrap().mib(), 128);
    }

    #[test]
    fn test_create_twice_fails() {
        let (_dir, controller) = controller();
        let name = ScopeName::new("twice001").unwrap();
        controller.create(&name).unwrap();
        let err = controller.create(&name).unwrap_err();
        assert!(matches!(err, Error::Setup(SetupError::ScopeCreate { .. })));
    }

    #[test]
    fn test_live_member_blocks_removal() {
        let (_dir, controller) = controller();
        let name = ScopeName::new("busy0001").unwrap();
        controller.create(&name).unwrap();
        controller.join(&name, std::process::id() as i32).unwrap();

        let err = controller.remove(&name).unwrap_err();
        assert!(matches!(err, Error::Scope(ScopeError::Busy { members: 1, .. })));
        assert!(controller.scope_path(&name).exists());
    }

    #[test]
    fn test_dead_members_do_not_block_removal() {
        let (_dir, controller) = controller();
        let name = ScopeName::new("dead0001").unwrap();
        controller.create(&name).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        controller.join(&name, pid).unwrap();

        assert_eq!(controller.recorded_members(&name).unwrap(), vec![pid]);
        assert!(controller.members(&name).unwrap().is_empty());
        controller.remove(&name).unwrap();
        assert!(!controller.scope_path(&name).exists());

        // Removing again is not an error
        controller.remove(&name).unwrap();
    }

    #[test]
    fn test_reclaim_writes_trigger() {
        let (_dir, controller) = controller();
        let name = ScopeName::new("free0001").unwrap();
        controller.create(&name).unwrap();
        controller.reclaim(&name).unwrap();
        let raw = fs::read_to_string(controller.control_path(&name, "memory.faascale.free")).unwrap();
        assert_eq!(raw, "1");
    }
}
