//! memgroup-cgroup: named memory groups on cgroup v2
//!
//! A group is a directory under the cgroup root. Its aggregate cap lives in
//! `memory.max`; each member additionally gets an `RLIMIT_AS` cap of its own.

pub mod handle;
pub mod limits;
pub mod procs;
pub mod rlimit;

pub use handle::{CGROUP_ROOT_ENV, ResourceGroupHandle, cgroup_root_path};
pub use limits::{LimitFlags, MIN_WORKING_SET, ResourceGroupLimits};
pub use procs::{DEFAULT_PID_CAPACITY, ProcessIdList};
