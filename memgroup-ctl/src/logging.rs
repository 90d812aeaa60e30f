use console::style;
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Initialize logger based on verbose flag; `RUST_LOG` wins when set
pub fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let env = Env::default().filter_or("RUST_LOG", default_level);

    Builder::from_env(env)
        .format(move |buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            if verbose {
                writeln!(
                    buf,
                    "{} {} {}",
                    level,
                    style(record.target()).dim(),
                    record.args()
                )
            } else {
                writeln!(buf, "{} {}", level, record.args())
            }
        })
        .init();
}
