//! Logger initialization for the command-line tool

use std::io::Write;

use env_logger::{Builder, Env};
use log::{Level, LevelFilter};

/// Initialize the logger with a colored, target-free format.
///
/// `RUST_LOG` overrides the default level as usual.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::from_env(Env::default().default_filter_or(filter.as_str()))
        .format(|f, record| {
            let style = f.default_level_style(record.level());
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN",
                Level::Info => "INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };

            writeln!(f, "[{style}{level}{style:#}] {}", record.args())
        })
        .init();
}
