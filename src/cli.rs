//! Command line arguments.

use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::worker::{ExitPolicy, TRANSIENT_EXIT_CODE};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mpegts-proxy",
    version,
    about = "Serve static media sources as live MPEG-TS over HTTP, one transcoder per client.",
    long_about = None
)]
pub struct CliArgs {
    /// The port the HTTP server should be listening on.
    #[arg(short, long, env = "PORT")]
    pub port: u16,

    /// Address to bind. `::` accepts both IPv4 and IPv6 clients.
    #[arg(short, long, env = "BIND_ADDR", default_value = "::")]
    pub bind: IpAddr,

    /// The path to avconv (or ffmpeg).
    #[arg(short, long, env = "AVCONV", default_value = "avconv")]
    pub avconv: String,

    /// The path to sources.json.
    #[arg(short, long, value_name = "PATH", default_value = "data/sources.json")]
    pub sources: PathBuf,

    /// Disable console logging.
    #[arg(short, long)]
    pub quiet: bool,

    /// Worker exit code treated as transient; the worker is restarted on the
    /// same response. May be given several times.
    #[arg(long = "retry-exit-code", value_name = "CODE", default_values_t = [TRANSIENT_EXIT_CODE])]
    pub retry_exit_codes: Vec<i32>,

    /// Logging level. Overrides `RUST_LOG`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

impl CliArgs {
    pub fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy::new(self.retry_exit_codes.clone())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
