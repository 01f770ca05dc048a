//! `qmpbackup` — drives one live backup run against a running QEMU guest.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use qmpbackup_core::cancel::CancelToken;
use qmpbackup_core::fleecing::{AioMode, FleecingOptions};
use qmpbackup_core::level::BackupLevel;
use qmpbackup_core::orchestrator::{self, RunOptions};

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "qmpbackup", version, about = "Live backup driver for QEMU/KVM guests")]
struct Cli {
    /// Backup level to run.
    #[arg(long, value_parser = parse_level)]
    level: BackupLevel,

    /// Root backup directory this run writes into.
    #[arg(long)]
    target: PathBuf,

    /// Path to the QMP monitor Unix socket.
    #[arg(long)]
    socket: PathBuf,

    /// Path to the guest-agent Unix socket. Omit to skip filesystem freeze.
    #[arg(long)]
    agent_socket: Option<PathBuf>,

    /// Device or node names to include exclusively.
    #[arg(long = "include")]
    include: Vec<String>,

    /// Device or node names to exclude.
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Back up raw-format devices too (excluded by default).
    #[arg(long)]
    include_raw: bool,

    /// Request job-level compression on non-raw backups.
    #[arg(long)]
    compress: bool,

    /// Flatten the on-disk layout: no per-device subdirectory.
    #[arg(long)]
    no_subdir: bool,

    /// Omit the `{LEVEL}-{ts}-` prefix for full/copy targets.
    #[arg(long)]
    no_timestamp: bool,

    /// Skip the fleecing node chain and read incrementals directly off the
    /// device.
    #[arg(long)]
    no_fleece: bool,

    /// Do not persist a freshly created full-backup bitmap.
    #[arg(long)]
    no_persist: bool,

    /// Throughput cap in bytes/sec, 0 for unlimited.
    #[arg(long, default_value_t = 0)]
    speed_limit: u64,

    /// Seconds between `query-block-jobs` polls.
    #[arg(long, default_value_t = 1)]
    refresh_rate: u64,

    /// AIO backend for attached target/fleece file children.
    #[arg(long, default_value = "threads")]
    blockdev_aio: AioMode,

    /// Disable the host page cache on attached file children.
    #[arg(long)]
    blockdev_disable_cache: bool,

    /// One-second-spaced monitor connection retries before failing.
    #[arg(long, default_value_t = 0)]
    connection_retry: u32,

    /// Increase log verbosity; repeat for more detail.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log rendering.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

fn parse_level(s: &str) -> Result<BackupLevel, String> {
    s.parse().map_err(|e: qmpbackup_core::level::ParseLevelError| e.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    if let Err(err) = dispatch(cli).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    if cli.level.requires_existing_chain() && cli.agent_socket.is_none() {
        tracing::warn!("no --agent-socket given; this will be a crash-consistent backup");
    }

    let timestamp = std::env::var("QMPBACKUP_TIMESTAMP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(unix_now);

    let opts = RunOptions {
        backupdir: cli.target,
        level: cli.level,
        include: cli.include,
        exclude: cli.exclude,
        include_raw: cli.include_raw,
        compress: cli.compress,
        no_subdir: cli.no_subdir,
        no_timestamp: cli.no_timestamp,
        no_fleece: cli.no_fleece,
        no_persist: cli.no_persist,
        speed_limit: cli.speed_limit,
        refresh_rate: Duration::from_secs(cli.refresh_rate.max(1)),
        fleecing: FleecingOptions { aio: cli.blockdev_aio, disable_cache: cli.blockdev_disable_cache },
        connection_retry: cli.connection_retry,
        agent_socket: cli.agent_socket,
        timestamp,
    };

    let cancel = CancelToken::new();
    cancel.spawn_signal_handler();

    let outcomes = orchestrator::run(cli.socket, opts, cancel).await.context("backup run failed")?;
    for outcome in outcomes {
        println!("{}: {}", outcome.device, outcome.target_path.display());
    }
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
