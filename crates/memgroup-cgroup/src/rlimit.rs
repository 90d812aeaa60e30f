//! Per-process memory cap via prlimit
//!
//! cgroup v2 has no per-member memory knob, so each member gets an
//! `RLIMIT_AS` cap of its own when it joins the group.

use memgroup_core::{GroupError, Result};
use nix::unistd::Pid;

/// Set the address-space limit (soft and hard) of `pid` to `limit` bytes
pub fn set_process_memory_limit(pid: Pid, limit: u64) -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };

    let ret = unsafe {
        libc::prlimit(
            pid.as_raw(),
            libc::RLIMIT_AS,
            &rlim,
            std::ptr::null_mut(),
        )
    };
    if ret != 0 {
        return Err(GroupError::os(
            "prlimit(RLIMIT_AS)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Current address-space limit of `pid`, `None` when unlimited
pub fn process_memory_limit(pid: Pid) -> Result<Option<u64>> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let ret = unsafe { libc::prlimit(pid.as_raw(), libc::RLIMIT_AS, std::ptr::null(), &mut rlim) };
    if ret != 0 {
        return Err(GroupError::os(
            "prlimit(RLIMIT_AS)",
            std::io::Error::last_os_error(),
        ));
    }
    if rlim.rlim_cur == libc::RLIM_INFINITY {
        Ok(None)
    } else {
        Ok(Some(rlim.rlim_cur))
    }
}
