//! CLI command definitions.

use super::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QueueBackendArg {
    /// In-process only; lost on exit.
    Memory,
    /// JSON snapshot under `.ralphy/`; survives restarts.
    File,
    /// Distributed queue on a Redis instance.
    #[cfg(feature = "redis-queue")]
    Redis,
}

/// Ralphy - autonomous task execution against an AI engine CLI.
#[derive(Parser)]
#[command(name = "ralphy")]
#[command(version, about, propagate_version = true)]
pub struct Cli {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show version information
    Version,

    /// Run every pending task from a source file
    Run(RunArgs),

    /// Show task states from the durable state file
    Status(StatusArgs),

    /// Show queue partition counts
    Queue(QueueArgs),

    /// Collect stale hash-store caches and expired locks
    Gc(GcArgs),
}

/// Arguments for `run`.
#[derive(Args)]
pub struct RunArgs {
    /// Task source file (csv, yaml, json, or md)
    pub source: PathBuf,

    /// Project working directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Engine binary to drive
    #[arg(long, default_value = "claude")]
    pub engine: String,

    /// Extra arguments passed to the engine on every invocation
    #[arg(long = "engine-arg")]
    pub engine_args: Vec<String>,

    /// Model identifier forwarded to the engine
    #[arg(long)]
    pub model: Option<String>,

    /// Engine timeout in seconds
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,

    /// Queue backend
    #[arg(long, value_enum, default_value = "file")]
    pub queue: QueueBackendArg,

    /// Redis connection URL (redis backend only)
    #[cfg(feature = "redis-queue")]
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,
}

/// Arguments for `status`.
#[derive(Args)]
pub struct StatusArgs {
    /// Task source file the state belongs to
    pub source: PathBuf,

    /// Project working directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

/// Arguments for `queue`.
#[derive(Args)]
pub struct QueueArgs {
    /// Project working directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

/// Arguments for `gc`.
#[derive(Args)]
pub struct GcArgs {
    /// Project working directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Remove hash caches untouched for this many hours
    #[arg(long, default_value_t = 24)]
    pub max_age_hours: u64,
}
