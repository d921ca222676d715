//! Logger setup for the `detourd` binary.
//!
//! Levels use the kernel-style names of the daemon configuration file
//! (`EMERG` .. `DEBUG`, `DEFAULT` = everything); plain `log` level names
//! are accepted too. `RUST_LOG` takes precedence over both.

use anyhow::{Context, Result};
use log::LevelFilter;
use std::fs::OpenOptions;

/// Map a configured level name to a filter, None if unknown.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    let level = match name.trim().to_ascii_uppercase().as_str() {
        "EMERG" | "ALERT" | "CRIT" | "ERR" | "ERROR" => LevelFilter::Error,
        "WARNING" | "WARN" => LevelFilter::Warn,
        "NOTICE" | "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "DEFAULT" | "TRACE" => LevelFilter::Trace,
        "OFF" => LevelFilter::Off,
        _ => return None,
    };
    Some(level)
}

/// Install the global logger.
///
/// The level applies to the daemon's own modules; dependencies only log
/// warnings. With `logfile` set, output is appended to that file.
pub fn init(level: &str, logfile: Option<&str>) -> Result<()> {
    let level = parse_level(level).unwrap_or_else(|| {
        eprintln!("unknown log level {:?}, logging everything", level);
        LevelFilter::Trace
    });

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module("detour", level)
        .filter_module("detourd", level)
        .parse_env("RUST_LOG");

    if let Some(path) = logfile {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("Failed to open log file {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Logger already initialized")?;
    Ok(())
}
