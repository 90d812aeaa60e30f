//! Resource group manager: the lifecycle of one named memory group

use log::{debug, info, warn};
use memgroup_cgroup::limits::ResourceGroupLimits;
use memgroup_cgroup::procs::{DEFAULT_PID_CAPACITY, ProcessIdList};
use memgroup_cgroup::rlimit::{process_memory_limit, set_process_memory_limit};
use memgroup_cgroup::{ResourceGroupHandle, cgroup_root_path};
use memgroup_core::util::{parse_memory_size, validate_group_name};
use memgroup_core::{GroupError, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::launcher::ProcessHandle;

/// Resource group configuration
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Group name, unique under `root`
    pub name: String,
    /// Group namespace root
    pub root: PathBuf,
    /// Memory cap of each member, in bytes
    pub per_process_limit: u64,
    /// Optional (minimum, maximum) working-set bounds
    pub working_set: Option<(u64, u64)>,
    /// Kill remaining members when the group is closed
    pub kill_on_close: bool,
    /// Number of pids returned by one member-list query
    pub pid_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: format!("memgroup-{}", std::process::id()),
            root: cgroup_root_path(),
            per_process_limit: 0,
            working_set: None,
            kill_on_close: true,
            pid_capacity: DEFAULT_PID_CAPACITY,
        }
    }
}

impl GroupConfig {
    pub fn validate(&self) -> Result<()> {
        validate_group_name(&self.name)?;
        if self.pid_capacity == 0 {
            return Err(GroupError::InvalidConfig(
                "Pid list capacity must be greater than 0".to_string(),
            ));
        }
        self.initial_limits()?.validate()
    }

    /// Limits of the group while it holds a single member
    pub fn initial_limits(&self) -> Result<ResourceGroupLimits> {
        if self.per_process_limit == 0 {
            return Err(GroupError::InvalidConfig(
                "Per-process memory limit must be greater than 0".to_string(),
            ));
        }
        let limits = ResourceGroupLimits::for_members(self.per_process_limit, 1);
        match self.working_set {
            Some((min, max)) => limits.with_working_set(min, max),
            None => Ok(limits),
        }
    }
}

/// Builder for [`ResourceGroupManager`]
pub struct ResourceGroupBuilder {
    config: GroupConfig,
}

impl ResourceGroupBuilder {
    pub fn new(name: &str, per_process_limit: u64) -> Self {
        Self {
            config: GroupConfig {
                name: name.to_string(),
                per_process_limit,
                ..Default::default()
            },
        }
    }

    /// Set per-process limit from string (e.g., "100M")
    pub fn per_process_limit_str(mut self, s: &str) -> Result<Self> {
        self.config.per_process_limit = parse_memory_size(s)?;
        Ok(self)
    }

    /// Set the group namespace root
    pub fn root(mut self, path: impl AsRef<Path>) -> Self {
        self.config.root = path.as_ref().to_path_buf();
        self
    }

    pub fn working_set(mut self, minimum: u64, maximum: u64) -> Self {
        self.config.working_set = Some((minimum, maximum));
        self
    }

    pub fn kill_on_close(mut self, enabled: bool) -> Self {
        self.config.kill_on_close = enabled;
        self
    }

    pub fn pid_capacity(mut self, capacity: usize) -> Self {
        self.config.pid_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ResourceGroupManager> {
        self.config.validate()?;
        Ok(ResourceGroupManager::from_config(self.config))
    }
}

/// Owner of one named memory group.
///
/// Starts unmaterialized. [`materialize`](Self::materialize) creates the
/// group; from then on processes can be attached until the manager is
/// closed or dropped. Attach sequences are serialized internally, so a
/// manager can be shared between threads.
pub struct ResourceGroupManager {
    config: GroupConfig,
    handle: Mutex<Option<ResourceGroupHandle>>,
}

impl ResourceGroupManager {
    /// Manager for the group `name` capping each member at `per_process_limit` bytes
    pub fn new(name: &str, per_process_limit: u64) -> Result<Self> {
        ResourceGroupBuilder::new(name, per_process_limit).build()
    }

    pub fn builder(name: &str, per_process_limit: u64) -> ResourceGroupBuilder {
        ResourceGroupBuilder::new(name, per_process_limit)
    }

    fn from_config(config: GroupConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Directory backing the group
    pub fn group_path(&self) -> PathBuf {
        self.config.root.join(&self.config.name)
    }

    pub fn per_process_limit(&self) -> u64 {
        self.config.per_process_limit
    }

    /// Whether this manager currently owns a live group
    pub fn is_materialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Create the group.
    ///
    /// Fails with [`GroupError::AlreadyExists`] if a group of this name
    /// exists, including one this manager created earlier.
    pub fn materialize(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(GroupError::AlreadyExists(self.config.name.clone()));
        }

        let limits = self.config.initial_limits()?;
        let mut handle = ResourceGroupHandle::create(&self.config.root, &self.config.name, limits)?;
        handle.set_kill_on_close(self.config.kill_on_close);
        *guard = Some(handle);
        Ok(())
    }

    /// Whether the group exists. Safe to call in any state.
    pub fn exists(&self) -> bool {
        ResourceGroupHandle::exists(&self.config.root, &self.config.name)
    }

    /// Whether the limits last written to the group took effect.
    ///
    /// `false` before materialize, and after a materialize whose limit write
    /// failed: the group then exists but caps nothing.
    pub fn limits_applied(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(ResourceGroupHandle::limits_applied)
    }

    /// Live number of members.
    ///
    /// Before materialize this is [`GroupError::NotFound`], never `Ok(0)`.
    pub fn member_count(&self) -> Result<usize> {
        ResourceGroupHandle::member_count(
            &self.config.root,
            &self.config.name,
            self.config.pid_capacity,
        )
    }

    /// Live member list, truncated to the configured capacity
    pub fn members(&self) -> Result<ProcessIdList> {
        ResourceGroupHandle::process_ids(
            &self.config.root,
            &self.config.name,
            self.config.pid_capacity,
        )
    }

    /// Limits currently in force
    pub fn limits(&self) -> Result<ResourceGroupLimits> {
        let guard = self.lock();
        let handle = guard
            .as_ref()
            .ok_or_else(|| GroupError::NotMaterialized(self.config.name.clone()))?;
        handle.query_limits()
    }

    /// Place `process` in the group.
    ///
    /// With N members already present the aggregate cap is raised to cover
    /// N+1 first; if that fails the process is not attached. The process
    /// handle stays owned by the caller.
    pub fn attach(&self, process: &ProcessHandle) -> Result<()> {
        let mut guard = self.lock();
        let handle = guard
            .as_mut()
            .ok_or_else(|| GroupError::NotMaterialized(self.config.name.clone()))?;

        let members = self.member_count()?;
        if members > 0 {
            handle.update_aggregate_limit(members + 1)?;
        } else {
            debug!(
                "Group '{}' is empty; creation limits already cover one member",
                self.config.name
            );
        }

        if let Err(e) = Self::cap_and_assign(handle, process) {
            if members > 0
                && let Err(restore) = handle.update_aggregate_limit(members)
            {
                warn!(
                    "Unable to restore aggregate limit of '{}' for {} members: {}",
                    self.config.name, members, restore
                );
            }
            return Err(e);
        }

        info!(
            "Attached pid {} to group '{}' ({} members before)",
            process.pid(),
            self.config.name,
            members
        );
        Ok(())
    }

    fn cap_and_assign(handle: &ResourceGroupHandle, process: &ProcessHandle) -> Result<()> {
        let pid = process.pid();
        let previous = process_memory_limit(pid)?;
        set_process_memory_limit(pid, handle.per_process_limit())?;
        if let Err(e) = handle.assign(pid) {
            let restored = previous.unwrap_or(libc::RLIM_INFINITY);
            if let Err(restore) = set_process_memory_limit(pid, restored) {
                warn!("Unable to restore memory cap of pid {}: {}", pid, restore);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Materialize the group, then attach `process` if that succeeded
    pub fn materialize_and_attach(&self, process: &ProcessHandle) -> Result<()> {
        self.materialize()?;
        self.attach(process)
    }

    /// Kill every member without closing the group
    pub fn terminate_members(&self) -> Result<()> {
        let guard = self.lock();
        guard
            .as_ref()
            .ok_or_else(|| GroupError::NotMaterialized(self.config.name.clone()))?
            .terminate_members()
    }

    /// Close the group, reporting failures. Dropping the manager does the
    /// same silently.
    pub fn close(self) -> Result<()> {
        let handle = self
            .handle
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match handle {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ResourceGroupHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchedProcess, ProcessLauncher};
    use memgroup_cgroup::LimitFlags;
    use std::fs;
    use tempfile::tempdir;

    const MB: u64 = 1024 * 1024;

    fn manager_in(root: &Path, name: &str) -> ResourceGroupManager {
        ResourceGroupManager::builder(name, 50 * MB)
            .root(root)
            .build()
            .unwrap()
    }

    /// A plain directory has no kernel-populated files; add the member list.
    fn materialize_fake(manager: &ResourceGroupManager) {
        manager.materialize().unwrap();
        fs::write(manager.group_path().join("cgroup.procs"), "").unwrap();
    }

    fn sleeper() -> (LaunchedProcess, ProcessHandle) {
        let mut launched = ProcessLauncher::spawn("sleep", &["30".to_string()]).unwrap();
        let handle = launched.handle.take().expect("pidfd_open unsupported");
        (launched, handle)
    }

    fn reap(mut launched: LaunchedProcess, handle: ProcessHandle) {
        handle.terminate().unwrap();
        let _ = launched.child.wait();
    }

    #[test]
    fn test_group_config_default() {
        let config = GroupConfig::default();
        assert!(config.name.starts_with("memgroup-"));
        assert!(config.kill_on_close);
        assert_eq!(config.pid_capacity, DEFAULT_PID_CAPACITY);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_validates() {
        assert!(ResourceGroupManager::new("", MB).is_err());
        assert!(ResourceGroupManager::new("g", 0).is_err());
        assert!(
            ResourceGroupManager::builder("g", MB)
                .pid_capacity(0)
                .build()
                .is_err()
        );
        assert!(
            ResourceGroupManager::builder("g", 10 * MB)
                .working_set(MB, 100)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_builder_limit_from_string() {
        let manager = ResourceGroupManager::builder("g", 0)
            .per_process_limit_str("64M")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(manager.per_process_limit(), 64 * MB);
    }

    #[test]
    fn exists_false_before_and_true_after_materialize() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "exists");
        assert!(!manager.exists());
        assert!(!manager.is_materialized());
        manager.materialize().unwrap();
        for _ in 0..5 {
            assert!(manager.exists());
        }
        assert!(manager.is_materialized());
    }

    #[test]
    fn materialize_twice_is_rejected() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "twice");
        manager.materialize().unwrap();
        assert!(matches!(
            manager.materialize(),
            Err(GroupError::AlreadyExists(_))
        ));

        let other = manager_in(tmp.path(), "twice");
        assert!(matches!(
            other.materialize(),
            Err(GroupError::AlreadyExists(_))
        ));
        assert!(!other.is_materialized());
    }

    #[test]
    fn member_count_before_materialize_is_not_zero() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "unmaterialized");
        assert!(matches!(
            manager.member_count(),
            Err(GroupError::NotFound(_))
        ));
    }

    #[test]
    fn attach_requires_materialize() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "not-yet");
        let (launched, handle) = sleeper();
        assert!(matches!(
            manager.attach(&handle),
            Err(GroupError::NotMaterialized(_))
        ));
        assert!(matches!(
            manager.limits(),
            Err(GroupError::NotMaterialized(_))
        ));
        reap(launched, handle);
    }

    #[test]
    fn aggregate_tracks_member_count() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "aggregate");
        materialize_fake(&manager);
        assert_eq!(manager.member_count().unwrap(), 0);

        let mut children = Vec::new();
        for i in 1..=3u64 {
            let (launched, handle) = sleeper();
            manager.attach(&handle).unwrap();
            let limits = manager.limits().unwrap();
            assert_eq!(limits.aggregate_memory_limit, Some(50 * MB * i));
            assert_eq!(limits.per_process_memory_limit, Some(50 * MB));
            assert!(limits.flags.contains(LimitFlags::JOB_MEMORY));
            assert_eq!(manager.member_count().unwrap(), i as usize);
            children.push((launched, handle));
        }

        for (launched, handle) in children {
            reap(launched, handle);
        }
    }

    #[test]
    fn attach_caps_the_member() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "capped");
        materialize_fake(&manager);
        let (launched, handle) = sleeper();
        manager.attach(&handle).unwrap();
        assert_eq!(
            memgroup_cgroup::rlimit::process_memory_limit(handle.pid()).unwrap(),
            Some(50 * MB)
        );
        assert_eq!(manager.members().unwrap().pids, vec![handle.pid()]);
        reap(launched, handle);
    }

    #[test]
    fn failed_limit_update_aborts_attach() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "abort");
        materialize_fake(&manager);
        let (first, first_handle) = sleeper();
        manager.attach(&first_handle).unwrap();

        let memory_max = manager.group_path().join("memory.max");
        fs::remove_file(&memory_max).unwrap();
        fs::create_dir(&memory_max).unwrap();

        let (second, second_handle) = sleeper();
        assert!(manager.attach(&second_handle).is_err());
        assert_eq!(manager.member_count().unwrap(), 1);
        assert_eq!(
            memgroup_cgroup::rlimit::process_memory_limit(second_handle.pid()).unwrap(),
            memgroup_cgroup::rlimit::process_memory_limit(
                nix::unistd::Pid::from_raw(std::process::id() as i32)
            )
            .unwrap()
        );

        reap(first, first_handle);
        reap(second, second_handle);
    }

    #[test]
    fn attach_exited_process_fails() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "exited");
        materialize_fake(&manager);
        let mut launched = ProcessLauncher::spawn("true", &[]).unwrap();
        let handle = launched.handle.take().expect("pidfd_open unsupported");
        launched.child.wait().unwrap();
        assert!(manager.attach(&handle).is_err());
        assert_eq!(manager.member_count().unwrap(), 0);
    }

    #[test]
    fn failed_attach_restores_aggregate() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "restore");
        materialize_fake(&manager);
        let (first, first_handle) = sleeper();
        manager.attach(&first_handle).unwrap();
        assert_eq!(manager.limits().unwrap().aggregate_memory_limit, Some(50 * MB));

        let mut gone = ProcessLauncher::spawn("true", &[]).unwrap();
        let gone_handle = gone.handle.take().expect("pidfd_open unsupported");
        gone.child.wait().unwrap();

        assert!(manager.attach(&gone_handle).is_err());
        assert_eq!(manager.member_count().unwrap(), 1);
        assert_eq!(manager.limits().unwrap().aggregate_memory_limit, Some(50 * MB));

        reap(first, first_handle);
    }

    #[test]
    fn limits_applied_follows_the_group() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "applied");
        assert!(!manager.limits_applied());
        manager.materialize().unwrap();
        assert!(manager.limits_applied());
    }

    #[test]
    fn materialize_and_attach_stops_on_materialize_failure() {
        let tmp = tempdir().unwrap();
        fs::create_dir(tmp.path().join("occupied")).unwrap();
        let manager = manager_in(tmp.path(), "occupied");
        let (launched, handle) = sleeper();
        assert!(matches!(
            manager.materialize_and_attach(&handle),
            Err(GroupError::AlreadyExists(_))
        ));
        assert!(!manager.is_materialized());
        reap(launched, handle);
    }

    #[test]
    fn close_without_materialize_is_noop() {
        let tmp = tempdir().unwrap();
        let manager = manager_in(tmp.path(), "never");
        assert!(manager.close().is_ok());
        assert!(!tmp.path().join("never").exists());
    }

    #[test]
    fn manager_is_shareable_across_threads() {
        fn assert_sync<T: Send + Sync>() {}
        assert_sync::<ResourceGroupManager>();
    }
}
