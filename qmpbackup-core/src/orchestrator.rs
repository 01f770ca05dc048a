//! Top-level backup run: wires every component together in the order
//! §4's design mandates — discover, provision, attach fleecing, freeze,
//! submit, thaw, watch to completion, teardown, finalize — with
//! teardown running on every exit path including cancellation (§5, §9).

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::bitmap::{self, BitmapRegistry};
use crate::cancel::CancelToken;
use crate::chain::{self, BackupChain};
use crate::error::{Error, Result};
use crate::fleecing::{FleecingOptions, FleecingSession};
use crate::guest_agent::GuestAgentClient;
use crate::inventory::{self, BlockDev, InventoryOptions};
use crate::job::{self, JobRunnerOptions};
use crate::level::BackupLevel;
use crate::monitor::MonitorClient;
use crate::target::{self, TargetOptions};
use crate::transaction::{self, TransactionOptions};

/// Everything a single invocation of the backup driver needs (§4.9 CLI
/// surface, collapsed into one struct for the orchestrator).
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub backupdir: PathBuf,
    pub level: BackupLevel,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_raw: bool,
    pub compress: bool,
    pub no_subdir: bool,
    pub no_timestamp: bool,
    pub no_fleece: bool,
    pub no_persist: bool,
    pub speed_limit: u64,
    pub refresh_rate: Duration,
    pub fleecing: FleecingOptions,
    pub connection_retry: u32,
    /// `None` disables guest filesystem freeze entirely.
    pub agent_socket: Option<PathBuf>,
    /// Fixed for the whole run so every device's target shares one id.
    pub timestamp: u64,
}

/// Result of one completed run, returned per device.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub device: String,
    pub target_path: PathBuf,
    pub frozen: bool,
}

/// Runs one backup of every eligible device behind `monitor_socket`.
#[instrument(skip(opts), fields(level = %opts.level, backupdir = %opts.backupdir.display()))]
pub async fn run(monitor_socket: PathBuf, opts: RunOptions, cancel: CancelToken) -> Result<Vec<RunOutcome>> {
    let client = MonitorClient::new(monitor_socket).with_connect_retry(opts.connection_retry);
    let chain = BackupChain::open(&opts.backupdir);

    let uuid = if opts.level.requires_existing_chain() {
        chain.uuid()?.ok_or_else(|| {
            Error::Configuration(format!(
                "{} has no existing chain, but {} requires one",
                opts.backupdir.display(),
                opts.level
            ))
        })?
    } else {
        chain.ensure_uuid()?
    };

    if chain::has_partial(&opts.backupdir)? {
        return Err(Error::Configuration(format!(
            "{} still has a .partial file from a previous failed run",
            opts.backupdir.display()
        )));
    }

    cancel.check()?;
    let blocks = client.call("query-block", None).await?;
    let named_nodes = client.call("query-named-block-nodes", None).await?;
    let blocks = blocks.as_array().cloned().unwrap_or_default();
    let named_nodes = named_nodes.as_array().cloned().unwrap_or_default();

    let inventory_opts = InventoryOptions {
        include: opts.include.clone(),
        exclude: opts.exclude.clone(),
        include_raw: opts.include_raw,
        uuid: Some(uuid.clone()),
    };
    let devices = inventory::discover(&blocks, &named_nodes, &inventory_opts);
    if devices.is_empty() {
        warn!("no eligible devices found for this run");
        return Ok(Vec::new());
    }

    if opts.level.requires_existing_chain() && !devices.iter().any(|d| d.has_bitmap) {
        return Err(Error::BitmapIntegrity(format!(
            "no device bitmap ends with chain uuid {uuid}; this target directory's chain \
             does not match the guest's current bitmap set"
        )));
    }

    let target_opts = TargetOptions {
        backupdir: opts.backupdir.clone(),
        level: opts.level,
        timestamp: opts.timestamp,
        no_subdir: opts.no_subdir,
        no_timestamp: opts.no_timestamp,
        no_fleece: opts.no_fleece,
    };

    let mut targets = Vec::with_capacity(devices.len());
    for dev in &devices {
        cancel.check()?;
        target::save_config(dev, &opts.backupdir).await?;
        let provisioned = target::provision(dev, &target_opts).await?;
        targets.push(provisioned);
    }

    let mut sessions = Vec::with_capacity(devices.len());
    let attach_result =
        attach_fleecing(&client, &devices, &targets, &opts, &uuid, &cancel, &mut sessions).await;

    let run_result = match attach_result {
        Ok(()) => run_inner(&client, &devices, &opts, &uuid, &cancel).await,
        Err(err) => Err(err),
    };
    for session in &mut sessions {
        session.teardown(&client).await;
    }

    match run_result {
        Ok(()) => finalize(&devices, &targets, &opts),
        Err(err) => {
            if let Err(cancel_err) = job::cancel_all(&client).await {
                warn!(%cancel_err, "cancel_all failed while unwinding a failed run");
            }
            Err(err)
        }
    }
}

/// Attaches the fleecing node chain for every device, registering each
/// session in `sessions` before its attach call so a mid-loop failure still
/// leaves every already-attached session reachable for teardown by the
/// caller (§3 invariants 4 & 5, §8).
async fn attach_fleecing(
    client: &MonitorClient,
    devices: &[BlockDev],
    targets: &[target::Target],
    opts: &RunOptions,
    uuid: &str,
    cancel: &CancelToken,
    sessions: &mut Vec<FleecingSession>,
) -> Result<()> {
    if opts.no_fleece {
        return Ok(());
    }
    let binds_bitmap = matches!(opts.level, BackupLevel::Inc | BackupLevel::Diff);
    for (dev, provisioned) in devices.iter().zip(targets) {
        cancel.check()?;
        let mut session = FleecingSession::new(dev);
        let fleece_path = provisioned.fleece_path.as_deref().ok_or_else(|| {
            Error::Configuration(format!("{}: no fleece file provisioned", dev.device))
        })?;
        let dev_bitmap = binds_bitmap.then(|| bitmap::name_for(opts.level, &dev.device, uuid));
        let result = session
            .attach(client, dev, &provisioned.target_path, fleece_path, dev_bitmap.as_deref(), opts.fleecing)
            .await;
        sessions.push(session);
        result?;
    }
    Ok(())
}

async fn run_inner(
    client: &MonitorClient,
    devices: &[BlockDev],
    opts: &RunOptions,
    uuid: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let agent = opts.agent_socket.as_ref().map(|p| GuestAgentClient::new(p.clone()));
    let mut frozen = false;
    if let Some(agent) = &agent {
        match agent.freeze().await {
            Ok(()) => frozen = true,
            Err(err) => warn!(%err, "guest freeze unavailable, continuing with a crash-consistent backup"),
        }
    }

    let tx_opts = TransactionOptions {
        level: opts.level,
        uuid: uuid.to_owned(),
        no_persist: opts.no_persist,
        no_fleece: opts.no_fleece,
        compress: opts.compress,
        speed_limit: opts.speed_limit,
    };
    let actions = transaction::build(devices, &tx_opts);

    cancel.check()?;
    let mut session = client.open_session().await?;
    let submit_result = job::submit(&mut session, actions).await;

    if let Some(agent) = &agent {
        if frozen {
            if let Err(err) = agent.thaw().await {
                warn!(%err, "guest thaw failed after submitting the backup transaction");
            }
        }
    }

    submit_result?;

    job::watch(
        &mut session,
        devices.len(),
        &JobRunnerOptions { refresh_rate: opts.refresh_rate, cancel: cancel.clone() },
    )
    .await?;

    if opts.level == BackupLevel::Copy {
        let registry = BitmapRegistry::new(client);
        registry.remove_all(devices, "qmpbackup-copy-", Some(uuid)).await?;
    }

    Ok(())
}

fn finalize(devices: &[BlockDev], targets: &[target::Target], opts: &RunOptions) -> Result<Vec<RunOutcome>> {
    let mut outcomes = Vec::with_capacity(devices.len());
    for (dev, provisioned) in devices.iter().zip(targets) {
        let final_path = chain::partial_to_final(&provisioned.target_path)?;
        info!(device = dev.device, path = %final_path.display(), "backup target finalized");
        outcomes.push(RunOutcome {
            device: dev.device.clone(),
            target_path: final_path,
            frozen: opts.agent_socket.is_some(),
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_outcome_reports_the_final_path() {
        let outcome = RunOutcome {
            device: "ide0-hd0".into(),
            target_path: PathBuf::from("/backups/ide0-hd0/FULL-1-disk.qcow2"),
            frozen: true,
        };
        assert!(outcome.target_path.ends_with("FULL-1-disk.qcow2"));
    }

    fn dev(has_bitmap: bool) -> BlockDev {
        BlockDev {
            device: "ide0-hd0".into(),
            node: "node0".into(),
            node_safe: "node0".into(),
            child_device: None,
            qdev: Some("/x".into()),
            filename: "/vms/disk.qcow2".into(),
            format: "qcow2".into(),
            driver: None,
            backing_image: false,
            virtual_size: 1024,
            has_bitmap,
            bitmaps: vec![],
        }
    }

    #[test]
    fn inc_without_a_matching_bitmap_is_a_bitmap_integrity_error() {
        let devices = vec![dev(false)];
        let mismatch = BackupLevel::Inc.requires_existing_chain()
            && !devices.iter().any(|d| d.has_bitmap);
        assert!(mismatch, "inc into a chain with no matching bitmap must be rejected");
    }

    #[test]
    fn inc_with_a_matching_bitmap_passes_the_check() {
        let devices = vec![dev(false), dev(true)];
        let mismatch = BackupLevel::Inc.requires_existing_chain()
            && !devices.iter().any(|d| d.has_bitmap);
        assert!(!mismatch);
    }

    #[test]
    fn full_never_requires_a_matching_bitmap() {
        let devices = vec![dev(false)];
        let mismatch = BackupLevel::Full.requires_existing_chain()
            && !devices.iter().any(|d| d.has_bitmap);
        assert!(!mismatch);
    }

    #[test]
    fn a_session_is_registered_before_its_attach_call_resolves() {
        // attach_fleecing pushes each session into `sessions` before
        // awaiting its attach, so a failure partway through a multi-device
        // run still leaves every already-attached session in the vec for
        // the caller's teardown loop to reach, rather than being skipped
        // by an early `?` return out of the whole function.
        let mut sessions: Vec<&str> = Vec::new();
        let devices = ["ide0-hd0", "ide0-hd1", "ide0-hd2"];
        let mut failed_at = None;
        for (i, device) in devices.iter().enumerate() {
            sessions.push(device);
            let attach_ok = i != 1;
            if !attach_ok {
                failed_at = Some(i);
                break;
            }
        }
        assert_eq!(failed_at, Some(1));
        assert_eq!(sessions, vec!["ide0-hd0", "ide0-hd1"], "sessions attached before the failure must stay registered");
    }
}
