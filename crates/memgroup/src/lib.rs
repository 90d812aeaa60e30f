//! memgroup: run processes under a named memory group
//!
//! A group caps every member at the same per-process limit and caps the
//! whole group at `per-process limit × members`, re-deriving the aggregate
//! each time a member joins. Closing the group kills whatever is still in it.
//!
//! # Example
//!
//! ```ignore
//! use memgroup::{ProcessLauncher, ResourceGroupManager};
//!
//! let manager = ResourceGroupManager::new("workers", 50 * 1024 * 1024)?;
//! manager.materialize()?;
//!
//! let worker = ProcessLauncher::spawn("python3", &["worker.py".to_string()])?;
//! if let Some(handle) = worker.handle.as_ref() {
//!     manager.attach(handle)?;
//! }
//! println!("members: {}", manager.member_count()?);
//! ```

pub mod launcher;
pub mod manager;

pub use memgroup_cgroup::{
    LimitFlags, ProcessIdList, ResourceGroupHandle, ResourceGroupLimits, cgroup_root_path,
};
pub use memgroup_core::{self as core, GroupError, Result, SystemCapabilities, util};

pub use launcher::{LaunchedProcess, ProcessHandle, ProcessLauncher};
pub use manager::{GroupConfig, ResourceGroupBuilder, ResourceGroupManager};
