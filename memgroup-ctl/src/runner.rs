use console::style;
use log::{debug, info, warn};
use memgroup::util::{parse_memory_cap, parse_memory_size};
use memgroup::{
    GroupError, LaunchedProcess, ProcessLauncher, ResourceGroupLimits, ResourceGroupManager,
};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::cli::Cli;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process exit status of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    BadArguments,
    SpawnFailed,
    InvalidHandle,
    MaterializeFailed,
    AttachFailed,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::BadArguments => -1,
            RunStatus::SpawnFailed => -2,
            RunStatus::InvalidHandle => -3,
            RunStatus::MaterializeFailed => -4,
            RunStatus::AttachFailed => -5,
        }
    }
}

/// Configuration for one controller run
#[derive(Debug)]
pub struct RunConfig {
    pub name: String,
    pub per_process_limit: u64,
    pub program: String,
    pub args: Vec<String>,
    pub instances: usize,
    pub settle: Duration,
    pub timeout: Option<Duration>,
    pub working_set: Option<(u64, u64)>,
    pub cgroup_root: Option<PathBuf>,
    pub kill_on_close: bool,
    pub json: bool,
}

impl RunConfig {
    pub fn from_cli(cli: Cli) -> memgroup::Result<Self> {
        let (Some(memory_cap), Some(program)) = (cli.memory_cap, cli.program) else {
            return Err(GroupError::InvalidConfig(
                "Incorrect arg count: expected <memory_cap_in_mb> <program_to_run>".to_string(),
            ));
        };
        if cli.instances == 0 {
            return Err(GroupError::InvalidConfig(
                "--instances must be at least 1".to_string(),
            ));
        }

        let working_set = match (cli.min_working_set, cli.max_working_set) {
            (Some(min), Some(max)) => Some((parse_memory_size(&min)?, parse_memory_size(&max)?)),
            _ => None,
        };

        Ok(Self {
            name: cli
                .name
                .unwrap_or_else(|| format!("memgroup-{}", std::process::id())),
            per_process_limit: parse_memory_cap(&memory_cap)?,
            program,
            args: cli.args,
            instances: cli.instances,
            settle: Duration::from_millis(cli.settle_ms),
            timeout: cli.timeout.map(Duration::from_secs),
            working_set,
            cgroup_root: cli.cgroup_root,
            kill_on_close: !cli.no_kill_on_close,
            json: cli.json,
        })
    }

    fn manager(&self) -> memgroup::Result<ResourceGroupManager> {
        let mut builder = ResourceGroupManager::builder(&self.name, self.per_process_limit)
            .kill_on_close(self.kill_on_close);
        if let Some(root) = &self.cgroup_root {
            builder = builder.root(root);
        }
        if let Some((min, max)) = self.working_set {
            builder = builder.working_set(min, max);
        }
        builder.build()
    }
}

/// Summary printed once the group is torn down
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub group: String,
    pub per_process_limit: u64,
    pub limits: Option<ResourceGroupLimits>,
    pub members: Vec<MemberReport>,
    pub timed_out: bool,
}

#[derive(Debug, Serialize)]
pub struct MemberReport {
    pub pid: i32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub running: bool,
}

pub fn run_group(config: RunConfig) -> RunStatus {
    let manager = match config.manager() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            return RunStatus::BadArguments;
        }
    };

    let mut members: Vec<LaunchedProcess> = Vec::with_capacity(config.instances);
    for _ in 0..config.instances {
        let command_line = ProcessLauncher::command_line(&config.program, &config.args);
        println!("[Proc Start]: {}", command_line);

        let launched = match ProcessLauncher::spawn(&config.program, &config.args) {
            Ok(launched) => launched,
            Err(e) => {
                eprintln!(
                    "{} Spawning failed with the following parameters: {} ({})",
                    style("error:").red().bold(),
                    command_line,
                    e
                );
                terminate_all(&mut members);
                return RunStatus::SpawnFailed;
            }
        };

        if launched.handle.is_none() {
            eprintln!(
                "{} Process created but the OS returned an unusable handle.",
                style("error:").red().bold()
            );
            eprintln!(
                "Will not kill child process, as the handle is unusable. Please manually kill pid: {}",
                style(launched.pid()).bold()
            );
            terminate_all(&mut members);
            return RunStatus::InvalidHandle;
        }

        println!("Process ID: {}", launched.pid());
        members.push(launched);
    }

    if let Err(e) = manager.materialize() {
        eprintln!(
            "{} Unable to create group '{}': {} (error code {:?})",
            style("error:").red().bold(),
            manager.name(),
            e,
            e.os_code()
        );
        terminate_all(&mut members);
        return RunStatus::MaterializeFailed;
    }
    if !manager.limits_applied() {
        eprintln!(
            "{} Group '{}' was created but its limits could not be set; members will not be capped by the group",
            style("warning:").yellow().bold(),
            manager.name()
        );
    }

    // Give freshly spawned processes time to finish starting up.
    thread::sleep(config.settle);

    let attach_failure = members.iter().find_map(|launched| {
        let handle = launched.handle.as_ref()?;
        manager.attach(handle).err().map(|e| (handle.pid(), e))
    });
    if let Some((pid, e)) = attach_failure {
        // Kill the failed member along with every other member.
        terminate_all(&mut members);
        eprintln!(
            "{} Unable to assign pid {} to the group: {} (error code {:?})",
            style("error:").red().bold(),
            pid,
            e,
            e.os_code()
        );
        return RunStatus::AttachFailed;
    }

    match manager.member_count() {
        Ok(count) => println!("Count of assigned processes to group: {}", count),
        Err(e) => warn!("Unable to count group members: {}", e),
    }

    let limits = match manager.limits() {
        Ok(limits) => Some(limits),
        Err(e) => {
            warn!("{}", e);
            None
        }
    };
    if let Some(aggregate) = limits.and_then(|l| l.aggregate_memory_limit) {
        info!(
            "Group '{}' limits: {} bytes per process, {} bytes total",
            manager.name(),
            config.per_process_limit,
            aggregate
        );
    }

    if manager.limits_applied() {
        println!("Successfully set limits on the group. Waiting for members to exit.");
    } else {
        println!("Waiting for members to exit.");
    }
    let timed_out = wait_for_members(&mut members, config.timeout);
    // Without kill-on-close, members outliving the timeout are left running.
    let wait_for_exit = !(timed_out && !config.kill_on_close);

    let group = manager.name().to_string();
    if let Err(e) = manager.close() {
        warn!("Closing group '{}': {}", group, e);
    }

    let report = RunReport {
        group,
        per_process_limit: config.per_process_limit,
        limits,
        members: members
            .iter_mut()
            .map(|m| reap(m, wait_for_exit))
            .collect(),
        timed_out,
    };
    print_report(&report, config.json);

    RunStatus::Success
}

/// Poll until every member exited or `timeout` elapsed; true on timeout
fn wait_for_members(members: &mut [LaunchedProcess], timeout: Option<Duration>) -> bool {
    let start = Instant::now();
    loop {
        let mut running = 0;
        for member in members.iter_mut() {
            if let Ok(None) = member.child.try_wait() {
                running += 1;
            }
        }
        if running == 0 {
            return false;
        }
        if let Some(limit) = timeout
            && start.elapsed() >= limit
        {
            debug!("Timeout reached with {} members running", running);
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Collect a member's exit status; with `wait` unset a running member is
/// reported as such instead of blocking on it
fn reap(launched: &mut LaunchedProcess, wait: bool) -> MemberReport {
    use std::os::unix::process::ExitStatusExt;

    let pid = launched.pid().as_raw();
    let status = if wait {
        launched.child.wait().map(Some)
    } else {
        launched.child.try_wait()
    };
    match status {
        Ok(Some(status)) => MemberReport {
            pid,
            exit_code: status.code(),
            signal: status.signal(),
            running: false,
        },
        Ok(None) => MemberReport {
            pid,
            exit_code: None,
            signal: None,
            running: true,
        },
        Err(e) => {
            warn!("Failed to wait for pid {}: {}", pid, e);
            MemberReport {
                pid,
                exit_code: None,
                signal: None,
                running: false,
            }
        }
    }
}

/// Kill every member and collect it
fn terminate_all(members: &mut [LaunchedProcess]) {
    for member in members.iter_mut() {
        if let Some(handle) = member.handle.as_ref()
            && let Err(e) = handle.terminate()
        {
            warn!("Failed to terminate pid {}: {}", handle.pid(), e);
            continue;
        }
        let _ = member.child.wait();
    }
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(out) => println!("{}", out),
            Err(e) => warn!("Failed to serialize report: {}", e),
        }
        return;
    }

    for member in &report.members {
        let outcome = match (member.exit_code, member.signal) {
            (Some(0), _) => style("exit_code=0".to_string()).green().bold(),
            (Some(code), _) => style(format!("exit_code={}", code)).red().bold(),
            (None, Some(signal)) => style(format!("signal={}", signal)).red().bold(),
            (None, None) if member.running => style("still running".to_string()).yellow(),
            (None, None) => style("unknown".to_string()).dim(),
        };
        println!("{}={} | {}", style("pid").dim(), member.pid, outcome);
    }
    if report.timed_out {
        println!("{}={}", style("timed_out").red(), style("true").red().bold());
    }
}
