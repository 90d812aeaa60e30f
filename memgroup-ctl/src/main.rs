//! memgroup controller CLI - Run programs under a shared memory cap

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use clap::error::ErrorKind;
use cli::Cli;
use commands::check_requirements;
use console::style;
use runner::{RunConfig, RunStatus, run_group};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                _ => std::process::exit(RunStatus::BadArguments.code()),
            }
        }
    };

    logging::init_logger(cli.verbose);

    if cli.check {
        check_requirements(cli.cgroup_root.as_deref());
        return;
    }

    let config = match RunConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            eprintln!(
                "Usage: {}",
                style("memgroup-ctl <memory_cap_in_mb> <program_to_run> <arg0> <arg1> ...").cyan()
            );
            std::process::exit(RunStatus::BadArguments.code());
        }
    };

    let status = run_group(config);
    std::process::exit(status.code());
}
