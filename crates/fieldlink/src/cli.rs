//! Clap derive structures for the `fieldlink` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// fieldlink -- telemetry acquisition and reconciliation
#[derive(Debug, Parser)]
#[command(
    name = "fieldlink",
    version,
    about = "Acquire field telemetry and reconcile it into the entity graph",
    long_about = "Polls BACnet controllers, REST services and delimited TCP streams,\n\
        publishes normalized events, and reconciles those events into\n\
        platforms, sensors and timeseries.\n\n\
        `broker` writes events as JSON lines to stdout and `store` reads them\n\
        from stdin, so the two halves can run as separate processes:\n\
        fieldlink broker | fieldlink store",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "FIELDLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run acquisition only, writing events as JSON lines to stdout
    Broker(BrokerArgs),

    /// Run the receiver only, reading JSON-line events from stdin
    Store(StoreArgs),

    /// Run acquisition and the receiver in one process
    Run(RunArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct BrokerArgs {
    /// Only start the named controller(s)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Print a summary of stored entities on exit
    #[arg(long)]
    pub summary: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Only start the named controller(s)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Stop after this long (e.g. "10m"); runs until a signal otherwise
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML, secrets masked
    Show,
    /// Print the config file path
    Path,
    /// Load and validate, then list configured controllers
    Check,
}
