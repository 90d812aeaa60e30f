//! Process-id list query over `cgroup.procs`

use memgroup_core::{GroupError, Result};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;

/// Default number of pids returned by a list query
pub const DEFAULT_PID_CAPACITY: usize = 64;

/// Members of a group as seen by one query.
///
/// `assigned` counts every member. `pids` holds at most the requested
/// capacity, so it can be shorter than `assigned`; the count stays
/// authoritative either way.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessIdList {
    pub assigned: usize,
    pub pids: Vec<Pid>,
}

impl ProcessIdList {
    pub fn is_truncated(&self) -> bool {
        self.pids.len() < self.assigned
    }

    /// Parse the contents of a `cgroup.procs` file, keeping at most `capacity` pids
    pub fn parse(content: &str, capacity: usize) -> Result<Self> {
        let mut list = ProcessIdList::default();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let raw: i32 = line.parse().map_err(|e| {
                GroupError::Cgroup(format!("Invalid pid {:?} in cgroup.procs: {}", line, e))
            })?;
            list.assigned += 1;
            if list.pids.len() < capacity {
                list.pids.push(Pid::from_raw(raw));
            }
        }
        Ok(list)
    }
}

/// Read the member list of the group rooted at `group_dir`
pub fn read_process_ids(group_dir: &Path, capacity: usize) -> Result<ProcessIdList> {
    let procs_file = group_dir.join("cgroup.procs");
    let content = fs::read_to_string(&procs_file)
        .map_err(|e| GroupError::os("read cgroup.procs", e))?;
    ProcessIdList::parse(&content, capacity)
}
