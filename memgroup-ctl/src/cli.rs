use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memgroup-ctl")]
#[command(version, about = "Run programs under a shared memory cap", long_about = None)]
#[command(after_help = "EXAMPLES:
    # One process capped at 50 MiB
    memgroup-ctl 50 python3 worker.py

    # Two copies sharing a group: each capped at 50 MiB, 100 MiB together
    memgroup-ctl --instances 2 50 python3 worker.py

    # Stop after 10 seconds, killing whatever is still running
    memgroup-ctl --timeout 10 512M ./server --port 8080

    # Check whether memory groups are usable here
    memgroup-ctl --check

EXIT CODES:
    0 success, -1 bad arguments, -2 spawn failed, -3 no usable process handle,
    -4 group creation failed, -5 attach failed
")]
pub struct Cli {
    /// Memory cap per process (MiB, or a size such as 512K, 100M, 1G)
    #[arg(value_name = "MEMORY_CAP_IN_MB")]
    pub memory_cap: Option<String>,

    /// Program to run
    #[arg(value_name = "PROGRAM")]
    pub program: Option<String>,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Group name (defaults to memgroup-<pid>)
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Number of copies of the program to launch into the group
    #[arg(short = 'n', long, value_name = "COUNT", default_value_t = 1)]
    pub instances: usize,

    /// Delay between spawning and attaching, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 200)]
    pub settle_ms: u64,

    /// Tear the group down after this many seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Protected working set of the group (e.g. 200K, 16M)
    #[arg(long, value_name = "SIZE", requires = "max_working_set")]
    pub min_working_set: Option<String>,

    /// Working set above which the group is throttled
    #[arg(long, value_name = "SIZE", requires = "min_working_set")]
    pub max_working_set: Option<String>,

    /// Cgroup root to create the group under
    #[arg(long, value_name = "PATH", env = "MEMGROUP_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Leave running members alive when the controller exits
    #[arg(long)]
    pub no_kill_on_close: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Show verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Check memory group requirements
    #[arg(long)]
    pub check: bool,
}
