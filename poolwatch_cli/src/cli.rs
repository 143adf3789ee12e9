//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "poolwatch", version, about = "Pool telemetry monitor")]
pub struct Cli {
    /// Path to config TOML; built-in defaults when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print status and errors as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run simulated devices through the monitor and print status changes
    Simulate {
        /// Number of generated devices (pool1..poolN) when the config lists none
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..=500))]
        devices: u16,
        /// How long to run, in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Start a test session on this device (repeatable)
        #[arg(long = "test", value_name = "DEVICE")]
        test: Vec<String>,
        /// This device never publishes telemetry (repeatable)
        #[arg(long = "silent", value_name = "DEVICE")]
        silent: Vec<String>,
        /// Reject every Nth sample save
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
        fail_every: Option<u32>,
        /// Interval between simulated samples per device, in ms
        #[arg(long, value_name = "MS", default_value_t = 250)]
        tick_ms: u64,
        /// Override timeouts.session_ms
        #[arg(long, value_name = "MS")]
        session_ms: Option<u64>,
        /// Override timeouts.connect_ms
        #[arg(long, value_name = "MS")]
        connect_ms: Option<u64>,
    },
    /// Validate a config file and print a short summary
    CheckConfig,
}
