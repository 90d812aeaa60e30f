//! Runtime detection of available system capabilities
//!
//! Probes the running kernel and cgroup hierarchy to determine whether memory
//! groups can be created and enforced here.

use std::path::Path;

use crate::util::{get_uid, is_root};

const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";

/// Detected system capabilities for resource groups
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// Cgroup v2 unified hierarchy is mounted
    pub has_cgroup_v2: bool,
    /// The memory controller is available at the cgroup root
    pub has_memory_controller: bool,
    /// `cgroup.kill` is supported (Linux 5.14+)
    pub has_cgroup_kill: bool,
    /// `pidfd_open(2)` is supported (Linux 5.3+)
    pub has_pidfd: bool,
    /// Cgroup delegation is available for current user
    pub has_cgroup_delegation: bool,
}

impl SystemCapabilities {
    /// Detect all available capabilities on the current system
    pub fn detect() -> Self {
        Self::detect_at(Path::new(CGROUP_V2_ROOT))
    }

    /// Detect capabilities for groups created under `root`
    pub fn detect_at(root: &Path) -> Self {
        Self {
            has_root: is_root(),
            has_cgroup_v2: detect_cgroup_v2(root),
            has_memory_controller: detect_memory_controller(root),
            has_cgroup_kill: detect_cgroup_kill(root),
            has_pidfd: detect_pidfd(),
            has_cgroup_delegation: detect_cgroup_delegation(root),
        }
    }

    /// Check if memory groups can be created and enforced
    pub fn can_manage_groups(&self) -> bool {
        self.has_cgroup_v2
            && self.has_memory_controller
            && (self.has_root || self.has_cgroup_delegation)
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        [
            format!("{} Root privileges", check(self.has_root)),
            format!("{} Cgroup v2", check(self.has_cgroup_v2)),
            format!("{} Memory controller", check(self.has_memory_controller)),
            format!("{} cgroup.kill", check(self.has_cgroup_kill)),
            format!("{} pidfd_open", check(self.has_pidfd)),
            format!("{} Cgroup delegation", check(self.has_cgroup_delegation)),
        ]
        .join("\n")
    }
}

fn detect_cgroup_v2(root: &Path) -> bool {
    root.join("cgroup.controllers").exists()
}

fn detect_memory_controller(root: &Path) -> bool {
    std::fs::read_to_string(root.join("cgroup.controllers"))
        .map(|content| content.split_whitespace().any(|c| c == "memory"))
        .unwrap_or(false)
}

fn detect_cgroup_kill(root: &Path) -> bool {
    // The root cgroup has no cgroup.kill; look at our own group instead.
    if root.join("cgroup.kill").exists() {
        return true;
    }
    let Ok(content) = std::fs::read_to_string("/proc/self/cgroup") else {
        return false;
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|rel| {
            root.join(rel.trim_start_matches('/'))
                .join("cgroup.kill")
                .exists()
        })
        .unwrap_or(false)
}

fn detect_pidfd() -> bool {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, libc::getpid(), 0) };
    if ret >= 0 {
        unsafe { libc::close(ret as libc::c_int) };
        return true;
    }
    false
}

fn detect_cgroup_delegation(root: &Path) -> bool {
    if is_root() {
        return true;
    }

    let user_slice = root.join(format!("user.slice/user-{}.slice", get_uid()));
    let path = if user_slice.exists() {
        user_slice
    } else {
        root.to_path_buf()
    };

    let test_path = path.join(format!("memgroup-probe-{}", std::process::id()));
    match std::fs::create_dir(&test_path) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&test_path);
            true
        }
        Err(_) => false,
    }
}
