//! Resource scopes.
//!
//! A resource scope is a named directory under a controller root whose
//! control entries carry a memory budget, the set of member processes and a
//! reclaim trigger. Scopes are created per scale invocation and removed once
//! their last member is gone.

mod cgroup;
mod controller;
mod directory;
mod scope;

pub use cgroup::{CgroupController, DEFAULT_CGROUP_ROOT};
pub use controller::{ControlFiles, ScopeController};
pub use directory::DirectoryController;
pub use scope::{ResourceScope, RetryPolicy, ScopeName};
