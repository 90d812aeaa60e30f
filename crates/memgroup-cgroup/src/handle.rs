//! Named cgroup v2 resource group and the handle that owns it

use log::{debug, error, info, warn};
use memgroup_core::util::validate_group_name;
use memgroup_core::{GroupError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::limits::{LimitFlags, ResourceGroupLimits};
use crate::procs::{ProcessIdList, read_process_ids};

const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";

/// Environment variable overriding the group namespace root
pub const CGROUP_ROOT_ENV: &str = "MEMGROUP_CGROUP_ROOT";

const MEMORY_MAX: &str = "memory.max";
const MEMORY_LOW: &str = "memory.low";
const MEMORY_HIGH: &str = "memory.high";
const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_KILL: &str = "cgroup.kill";
const CGROUP_EVENTS: &str = "cgroup.events";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Root of the group namespace (`$MEMGROUP_CGROUP_ROOT`, else `/sys/fs/cgroup`)
pub fn cgroup_root_path() -> PathBuf {
    std::env::var(CGROUP_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_V2_ROOT))
}

fn open_group(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)
}

/// Owner of one named resource group.
///
/// The group lives while the handle is open. Dropping the handle (or calling
/// [`close`](Self::close)) kills remaining members when kill-on-close is set,
/// then removes the group. That only drops this process's ownership: a group
/// that still has members after close is left in place.
#[derive(Debug)]
pub struct ResourceGroupHandle {
    name: String,
    path: PathBuf,
    dir: Option<File>,
    base_limits: ResourceGroupLimits,
    per_process_limit: u64,
    limits_applied: bool,
    kill_on_close: bool,
}

impl ResourceGroupHandle {
    /// Create the group `name` under `root` and apply `limits` to it.
    ///
    /// `limits` describes the group with a single member. A group that
    /// already exists is rejected. If the limits cannot be written the
    /// handle is still returned, with [`limits_applied`](Self::limits_applied)
    /// reporting `false`.
    pub fn create(root: &Path, name: &str, limits: ResourceGroupLimits) -> Result<Self> {
        validate_group_name(name)?;
        limits.validate()?;
        let per_process_limit = limits.per_process_memory_limit.ok_or_else(|| {
            GroupError::InvalidConfig("Per-process memory limit is required".to_string())
        })?;

        if Self::exists(root, name) {
            return Err(GroupError::AlreadyExists(name.to_string()));
        }

        enable_memory_controller(root);

        let path = root.join(name);
        fs::create_dir(&path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => GroupError::AlreadyExists(name.to_string()),
            io::ErrorKind::PermissionDenied => GroupError::PermissionDenied(format!(
                "Cannot create group {}: {}",
                path.display(),
                e
            )),
            _ => GroupError::os("create group", e),
        })?;

        Self::open_created(name, path, limits, per_process_limit)
    }

    /// Take ownership of the freshly created group directory at `path`
    fn open_created(
        name: &str,
        path: PathBuf,
        limits: ResourceGroupLimits,
        per_process_limit: u64,
    ) -> Result<Self> {
        let dir = match open_group(&path) {
            Ok(dir) => dir,
            Err(e) => {
                let _ = fs::remove_dir(&path);
                return Err(GroupError::os("open group", e));
            }
        };

        let mut handle = Self {
            name: name.to_string(),
            path,
            dir: Some(dir),
            base_limits: limits,
            per_process_limit,
            limits_applied: false,
            kill_on_close: true,
        };

        match handle.apply_limits(&limits) {
            Ok(()) => handle.limits_applied = true,
            Err(e) => error!(
                "Unable to set limits on group '{}': {} (error code {:?})",
                name,
                e,
                e.os_code()
            ),
        }

        info!(
            "Created group '{}' at {} (per-process cap {} bytes)",
            handle.name,
            handle.path.display(),
            per_process_limit
        );
        Ok(handle)
    }

    /// Whether a group named `name` exists under `root`.
    ///
    /// Opens and immediately closes a separate descriptor, so the check never
    /// keeps the group alive. Access-denied is reported as absent.
    pub fn exists(root: &Path, name: &str) -> bool {
        if validate_group_name(name).is_err() {
            return false;
        }
        match open_group(&root.join(name)) {
            Ok(probe) => {
                drop(probe);
                true
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    debug!("Group '{}' exists but is not accessible: {}", name, e);
                }
                false
            }
        }
    }

    /// Live member list of the group `name`, through a fresh descriptor.
    ///
    /// A list longer than `capacity` is truncated, not an error.
    pub fn process_ids(root: &Path, name: &str, capacity: usize) -> Result<ProcessIdList> {
        validate_group_name(name)?;
        let path = root.join(name);
        let probe = open_group(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => GroupError::NotFound(name.to_string()),
            _ => GroupError::os("open group", e),
        })?;

        let list = read_process_ids(&path, capacity);
        drop(probe);

        let list = list.inspect_err(|e| {
            error!(
                "Unable to query members of group '{}': {} (error code {:?})",
                name,
                e,
                e.os_code()
            )
        })?;
        if list.is_truncated() {
            debug!(
                "Member list of '{}' truncated to {} of {} pids",
                name,
                list.pids.len(),
                list.assigned
            );
        }
        Ok(list)
    }

    /// Number of processes currently in the group `name`.
    ///
    /// `Ok(0)` means the group is empty; a failed query is an error.
    pub fn member_count(root: &Path, name: &str, capacity: usize) -> Result<usize> {
        Self::process_ids(root, name, capacity).map(|list| list.assigned)
    }

    /// Limits currently in force, read through a fresh descriptor.
    pub fn query_limits(&self) -> Result<ResourceGroupLimits> {
        self.ensure_open()?;

        let failed = |e: GroupError| {
            debug!("Limit query on '{}' failed: {}", self.name, e);
            GroupError::LimitQuery(self.name.clone())
        };

        let probe = open_group(&self.path).map_err(|e| failed(GroupError::os("open group", e)))?;
        let aggregate = read_limit(&self.path, MEMORY_MAX).map_err(failed)?;
        let low = read_optional_limit(&self.path, MEMORY_LOW).map_err(failed)?;
        let high = read_optional_limit(&self.path, MEMORY_HIGH).map_err(failed)?;
        drop(probe);

        let mut limits = ResourceGroupLimits {
            aggregate_memory_limit: aggregate,
            per_process_memory_limit: Some(self.per_process_limit),
            minimum_working_set: low.filter(|v| *v > 0),
            maximum_working_set: high,
            flags: LimitFlags::PROCESS_MEMORY,
        };
        if limits.aggregate_memory_limit.is_some() {
            limits.flags.insert(LimitFlags::JOB_MEMORY);
        }
        if limits.minimum_working_set.is_some() && limits.maximum_working_set.is_some() {
            limits.flags.insert(LimitFlags::WORKING_SET);
        }
        Ok(limits)
    }

    /// Re-derive the aggregate cap for `members` processes and apply it.
    pub fn update_aggregate_limit(&mut self, members: usize) -> Result<()> {
        self.ensure_open()?;
        let limits = self.base_limits.rescaled(members);
        self.apply_limits(&limits).inspect_err(|e| {
            error!(
                "Unable to raise aggregate limit of '{}' for {} members: {} (error code {:?})",
                self.name,
                members,
                e,
                e.os_code()
            )
        })?;
        self.limits_applied = true;
        debug!(
            "Group '{}' aggregate limit now {:?} for {} members",
            self.name, limits.aggregate_memory_limit, members
        );
        Ok(())
    }

    /// Move `pid` into the group
    pub fn assign(&self, pid: Pid) -> Result<()> {
        self.ensure_open()?;
        let mut procs = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.path.join(CGROUP_PROCS))
            .map_err(|e| GroupError::os("open cgroup.procs", e))?;
        // cgroupfs takes one pid per write(2); a split write is rejected.
        procs
            .write_all(format!("{}\n", pid.as_raw()).as_bytes())
            .map_err(|e| GroupError::os("assign process to group", e))?;
        debug!("Assigned pid {} to group '{}'", pid, self.name);
        Ok(())
    }

    /// Kill every member of the group
    pub fn terminate_members(&self) -> Result<()> {
        self.ensure_open()?;
        match fs::write(self.path.join(CGROUP_KILL), "1") {
            Ok(()) => return Ok(()),
            Err(e) => debug!(
                "cgroup.kill unavailable for '{}' ({}), signalling members",
                self.name, e
            ),
        }

        let list = read_process_ids(&self.path, usize::MAX)?;
        for pid in list.pids {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(GroupError::Syscall(format!(
                        "Failed to kill member {}: {}",
                        pid, e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Release the group now, reporting failures
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn per_process_limit(&self) -> u64 {
        self.per_process_limit
    }

    pub fn is_open(&self) -> bool {
        self.dir.is_some()
    }

    /// Whether the most recent limit write succeeded
    pub fn limits_applied(&self) -> bool {
        self.limits_applied
    }

    pub fn kill_on_close(&self) -> bool {
        self.kill_on_close
    }

    pub fn set_kill_on_close(&mut self, enabled: bool) {
        self.kill_on_close = enabled;
    }

    fn ensure_open(&self) -> Result<&File> {
        self.dir
            .as_ref()
            .ok_or_else(|| GroupError::NotMaterialized(self.name.clone()))
    }

    fn apply_limits(&self, limits: &ResourceGroupLimits) -> Result<()> {
        self.ensure_open()?;
        write_control(
            &self.path,
            MEMORY_MAX,
            &format_limit(limits.aggregate_memory_limit),
            "set memory.max",
        )?;
        if limits.flags.contains(LimitFlags::WORKING_SET) {
            write_control(
                &self.path,
                MEMORY_LOW,
                &limits.minimum_working_set.unwrap_or(0).to_string(),
                "set memory.low",
            )?;
            write_control(
                &self.path,
                MEMORY_HIGH,
                &format_limit(limits.maximum_working_set),
                "set memory.high",
            )?;
        }
        Ok(())
    }

    fn wait_until_drained(&self) {
        let events = self.path.join(CGROUP_EVENTS);
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            match fs::read_to_string(&events) {
                Ok(content) if content.lines().any(|l| l.trim() == "populated 1") => {
                    thread::sleep(DRAIN_POLL)
                }
                _ => return,
            }
        }
        warn!("Group '{}' still populated after kill", self.name);
    }

    fn release(&mut self) -> Result<()> {
        if self.dir.is_none() {
            return Ok(());
        }

        if self.kill_on_close {
            if let Err(e) = self.terminate_members() {
                warn!("Failed to kill members of '{}': {}", self.name, e);
            }
            self.wait_until_drained();
        }

        self.dir = None;

        match fs::remove_dir(&self.path) {
            Ok(()) => {
                info!("Closed group '{}'", self.name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && !self.kill_on_close => {
                info!(
                    "Group '{}' still has members; left in place",
                    self.name
                );
                Ok(())
            }
            Err(e) => Err(GroupError::os("remove group", e)),
        }
    }
}

impl Drop for ResourceGroupHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to close group '{}': {}", self.name, e);
        }
    }
}

fn enable_memory_controller(root: &Path) {
    let control = root.join(SUBTREE_CONTROL);
    let enabled = match fs::read_to_string(&control) {
        Ok(content) => content,
        Err(e) => {
            debug!("No subtree control at {}: {}", control.display(), e);
            return;
        }
    };
    if enabled.split_whitespace().any(|c| c == "memory") {
        return;
    }
    if let Err(e) = fs::write(&control, "+memory") {
        warn!(
            "Unable to enable the memory controller in {}: {}",
            root.display(),
            e
        );
    }
}

fn write_control(dir: &Path, file: &str, value: &str, op: &'static str) -> Result<()> {
    fs::write(dir.join(file), value).map_err(|e| GroupError::os(op, e))
}

fn format_limit(limit: Option<u64>) -> String {
    match limit {
        Some(bytes) => bytes.to_string(),
        None => "max".to_string(),
    }
}

fn parse_limit(content: &str) -> Result<Option<u64>> {
    let value = content.trim();
    if value == "max" {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|e| GroupError::Cgroup(format!("Failed to parse limit {:?}: {}", value, e)))
}

fn read_limit(dir: &Path, file: &str) -> Result<Option<u64>> {
    let content = fs::read_to_string(dir.join(file))
        .map_err(|e| GroupError::os("read memory limit", e))?;
    parse_limit(&content)
}

fn read_optional_limit(dir: &Path, file: &str) -> Result<Option<u64>> {
    match fs::read_to_string(dir.join(file)) {
        Ok(content) => parse_limit(&content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GroupError::os("read memory limit", e)),
    }
}
