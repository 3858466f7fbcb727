//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Filter priority:
//! 1. `--log-level` (applies to this crate and tower_http)
//! 2. `RUST_LOG`
//! 3. `mpegts_proxy=debug,tower_http=info`
//!
//! `--quiet` installs no subscriber at all.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogLevel;

const DEFAULT_DIRECTIVES: &str = "mpegts_proxy=debug,tower_http=info";

/// Initialise the global subscriber. Call once at startup.
pub fn init(quiet: bool, level: Option<LogLevel>) -> anyhow::Result<()> {
    if quiet {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(build_filter(level, std::env::var("RUST_LOG").ok().as_deref()))
        .try_init()?;

    Ok(())
}

fn build_filter(level: Option<LogLevel>, rust_log: Option<&str>) -> EnvFilter {
    match (level, rust_log) {
        (Some(level), _) => {
            let level = level_str(level);
            EnvFilter::new(format!("mpegts_proxy={level},tower_http={level}"))
        }
        (None, Some(directives)) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(DEFAULT_DIRECTIVES),
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
