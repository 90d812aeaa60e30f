//! Spawning member processes and holding native handles to them

use log::{debug, warn};
use memgroup_core::{GroupError, Result};
use nix::unistd::Pid;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Child, Command};

/// Native handle to a running process, backed by a pidfd.
///
/// The pidfd keeps referring to the same process even after its pid is
/// reused, so signals sent through it cannot hit a stranger.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    pidfd: OwnedFd,
}

impl ProcessHandle {
    /// Open a handle on `pid`
    pub fn open(pid: Pid) -> Result<Self> {
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if ret < 0 {
            return Err(GroupError::os(
                "pidfd_open",
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: pidfd_open returned a fresh descriptor that nothing else owns
        let pidfd = unsafe { OwnedFd::from_raw_fd(ret as RawFd) };
        Ok(Self { pid, pidfd })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process is still running (a pidfd turns readable on exit)
    pub fn is_alive(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret == 0
    }

    /// Kill the process with SIGKILL
    pub fn terminate(&self) -> Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                libc::SIGKILL,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!("Process {} already exited", self.pid);
                return Ok(());
            }
            return Err(GroupError::os("pidfd_send_signal", err));
        }
        Ok(())
    }
}

impl AsFd for ProcessHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pidfd.as_fd()
    }
}

/// A spawned program.
///
/// `handle` is `None` when the OS gave back a pid but no usable handle; such
/// a process cannot be placed in a group and has to be dealt with by pid.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub handle: Option<ProcessHandle>,
}

impl LaunchedProcess {
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

/// Starts programs for the group manager
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Spawn `program` with `args` and open a handle on it
    pub fn spawn(program: &str, args: &[String]) -> Result<LaunchedProcess> {
        let command_line = Self::command_line(program, args);
        debug!("Spawning {}", command_line);

        let child = Command::new(program).args(args).spawn().map_err(|e| {
            GroupError::Launch(format!("{}: {}", command_line, e))
        })?;

        let pid = Pid::from_raw(child.id() as i32);
        let handle = match ProcessHandle::open(pid) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Spawned pid {} but could not open a handle: {}", pid, e);
                None
            }
        };

        Ok(LaunchedProcess { child, handle })
    }

    /// Program and arguments joined by spaces, as printed in diagnostics
    pub fn command_line(program: &str, args: &[String]) -> String {
        std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_arguments() {
        assert_eq!(ProcessLauncher::command_line("sleep", &[]), "sleep");
        assert_eq!(
            ProcessLauncher::command_line("sleep", &["5".to_string(), "-x".to_string()]),
            "sleep 5 -x"
        );
    }

    #[test]
    fn spawn_missing_program_fails() {
        let err = ProcessLauncher::spawn("/nonexistent/memgroup-test-binary", &[]).unwrap_err();
        assert!(matches!(err, GroupError::Launch(_)));
    }

    #[test]
    fn spawn_returns_live_handle() {
        let mut launched = ProcessLauncher::spawn("sleep", &["5".to_string()]).unwrap();
        let handle = launched.handle.take().expect("pidfd_open unsupported");
        assert_eq!(handle.pid(), launched.pid());
        assert!(handle.is_alive());

        handle.terminate().unwrap();
        let status = launched.child.wait().unwrap();
        assert!(!status.success());
        assert!(!handle.is_alive());
    }

    #[test]
    fn terminate_after_exit_is_ok() {
        let mut launched = ProcessLauncher::spawn("true", &[]).unwrap();
        let handle = launched.handle.take().expect("pidfd_open unsupported");
        launched.child.wait().unwrap();
        assert!(handle.terminate().is_ok());
    }

    #[test]
    fn open_missing_pid_fails() {
        assert!(ProcessHandle::open(Pid::from_raw(i32::MAX)).is_err());
    }
}
