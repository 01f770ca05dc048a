//! `qmpbackup-util` — post-processing driver: folds a chain of incremental
//! images back into a flat base image after backups have been taken.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

#[path = "../logging.rs"]
mod logging;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use qmpbackup_core::postprocess;

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "qmpbackup-util", version, about = "Post-processing for qmpbackup chains")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity; repeat for more detail.
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log rendering.
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Root backup directory, or a single device's chain subdirectory.
    #[arg(long)]
    dir: PathBuf,

    /// Stop processing once the image with exactly this filename has been
    /// handled.
    #[arg(long)]
    until: Option<String>,

    /// Report what would happen without touching any image.
    #[arg(long)]
    dry_run: bool,

    /// Throughput cap in bytes/sec passed to `qemu-img commit`.
    #[arg(long)]
    rate_limit: Option<u64>,

    /// Skip `qemu-img check` on every image before folding it in.
    #[arg(long)]
    skip_check: bool,

    /// Process only device subdirectories whose name matches.
    #[arg(long)]
    filter: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Repoint each image at its predecessor without rewriting data.
    Rebase(CommonArgs),
    /// Clone the base and fold every incremental into the clone.
    Merge {
        #[command(flatten)]
        common: CommonArgs,
        /// Destination for the merged image.
        #[arg(long)]
        targetfile: PathBuf,
    },
    /// Fold every incremental into the base in place.
    Commit(CommonArgs),
    /// Like `commit`, but snapshots the base before each fold.
    SnapshotRebase(CommonArgs),
    /// Generate a shell completion script.
    #[command(hide = true)]
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    if let Err(err) = dispatch(cli.command).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

/// Directories to process: every immediate subdirectory of `dir` matching
/// `filter` when `dir` itself holds subdirectories, else `dir` alone (a
/// single device's chain directory).
fn target_dirs(dir: &Path, filter: &[String]) -> Result<Vec<PathBuf>> {
    let subdirs: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .filter(|p| {
            filter.is_empty()
                || p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| filter.iter().any(|f| f == n))
        })
        .collect();

    if subdirs.is_empty() { Ok(vec![dir.to_path_buf()]) } else { Ok(subdirs) }
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Rebase(args) => {
            for dir in target_dirs(&args.dir, &args.filter)? {
                postprocess::rebase(&dir, args.until.as_deref(), args.dry_run, args.skip_check)
                    .await
                    .with_context(|| format!("rebase failed for {}", dir.display()))?;
            }
        }
        Command::Merge { common, targetfile } => {
            if common.dry_run {
                tracing::warn!("--dry-run has no effect on merge, ignoring");
            }
            postprocess::merge(
                &common.dir,
                &targetfile,
                common.until.as_deref(),
                common.rate_limit,
                common.skip_check,
            )
            .await
            .with_context(|| format!("merge failed for {}", common.dir.display()))?;
        }
        Command::Commit(args) => {
            if args.dry_run {
                tracing::warn!("--dry-run has no effect on commit, ignoring");
            }
            for dir in target_dirs(&args.dir, &args.filter)? {
                postprocess::commit(&dir, args.until.as_deref(), args.rate_limit, args.skip_check)
                    .await
                    .with_context(|| format!("commit failed for {}", dir.display()))?;
            }
        }
        Command::SnapshotRebase(args) => {
            if args.dry_run {
                tracing::warn!("--dry-run has no effect on snapshot-rebase, ignoring");
            }
            for dir in target_dirs(&args.dir, &args.filter)? {
                postprocess::snapshot_rebase(&dir, args.until.as_deref(), args.rate_limit, args.skip_check)
                    .await
                    .with_context(|| format!("snapshot-rebase failed for {}", dir.display()))?;
            }
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "qmpbackup-util", &mut std::io::stdout());
        }
    }
    Ok(())
}
