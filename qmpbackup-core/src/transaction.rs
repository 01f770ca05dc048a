//! Transaction Builder (C5) — produces the ordered list of atomic
//! sub-actions to submit as a single `transaction` command for a given
//! backup level (§4.3). Pure: never mutates anything, never talks to the
//! monitor.

use serde_json::{Value, json};

use crate::bitmap;
use crate::inventory::BlockDev;
use crate::level::BackupLevel;
use crate::names;

/// Feature flags and run parameters the builder needs per §4.3.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Requested backup level.
    pub level: BackupLevel,
    /// Backup-chain UUID bitmaps are bound to.
    pub uuid: String,
    /// Suppress persistence on a fresh `full` bitmap.
    pub no_persist: bool,
    /// Whether the fleecing/CBW/snapshot-access nodes are in use for this
    /// run (affects which node `blockdev-backup` reads from).
    pub no_fleece: bool,
    /// Whether to request `compress` on non-raw backup jobs.
    pub compress: bool,
    /// Throughput cap in bytes/sec, `0` for unlimited.
    pub speed_limit: u64,
}

/// Builds the full ordered action list for every device in `devices`.
pub fn build(devices: &[BlockDev], opts: &TransactionOptions) -> Vec<Value> {
    let mut actions = Vec::new();
    for dev in devices {
        append_device_actions(&mut actions, dev, opts);
    }
    actions
}

fn append_device_actions(actions: &mut Vec<Value>, dev: &BlockDev, opts: &TransactionOptions) {
    let is_raw = dev.format == "raw";
    let bitmap_node = dev.bitmap_source_node();
    let target_node = names::target_node(&dev.node_safe);
    let persistent_name = bitmap::name_for(BackupLevel::Full, &dev.device, &opts.uuid);

    if !is_raw {
        match opts.level {
            BackupLevel::Full if !dev.has_bitmap => {
                actions.push(bitmap_add_action(bitmap_node, &persistent_name, !opts.no_persist));
            }
            BackupLevel::Copy => {
                let name = bitmap::name_for(BackupLevel::Copy, &dev.device, &opts.uuid);
                actions.push(bitmap_add_action(bitmap_node, &name, false));
            }
            _ => {}
        }
        if opts.level == BackupLevel::Full && dev.has_bitmap {
            actions.push(bitmap_clear_action(bitmap_node, &persistent_name));
        }
    }

    let read_node = if opts.no_fleece {
        bitmap_node.to_owned()
    } else {
        names::snapshot_access_node(bitmap_node)
    };

    let basename = std::path::Path::new(&dev.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&dev.filename);
    let job_id = names::job_id(&dev.node_safe, basename);

    let is_plain_full_backup =
        matches!(opts.level, BackupLevel::Full | BackupLevel::Copy)
            || (matches!(opts.level, BackupLevel::Inc | BackupLevel::Diff) && is_raw);
    if is_plain_full_backup {
        actions.push(blockdev_backup_action(
            &read_node,
            &target_node,
            &job_id,
            "full",
            None,
            opts.compress && !is_raw,
            opts.speed_limit,
        ));
    }

    if matches!(opts.level, BackupLevel::Inc | BackupLevel::Diff) && !is_raw {
        if opts.no_fleece {
            actions.push(blockdev_backup_action(
                bitmap_node,
                &target_node,
                &job_id,
                "incremental",
                Some(&persistent_name),
                opts.compress,
                opts.speed_limit,
            ));
        } else {
            let snap_node = names::snapshot_access_node(bitmap_node);
            let merged_name = format!("{snap_node}-merged");
            actions.push(bitmap_add_action(&snap_node, &merged_name, false));
            actions.push(bitmap_merge_action(&snap_node, &merged_name, &[persistent_name.clone()]));
            actions.push(blockdev_backup_action(
                &snap_node,
                &target_node,
                &job_id,
                "incremental",
                Some(&merged_name),
                opts.compress,
                opts.speed_limit,
            ));
        }

        if opts.level.clears_bitmap_on_success() {
            actions.push(bitmap_clear_action(bitmap_node, &persistent_name));
        }
    }
}

fn bitmap_add_action(node: &str, name: &str, persistent: bool) -> Value {
    json!({
        "type": "block-dirty-bitmap-add",
        "data": {"node": node, "name": name, "persistent": persistent},
    })
}

fn bitmap_clear_action(node: &str, name: &str) -> Value {
    json!({
        "type": "block-dirty-bitmap-clear",
        "data": {"node": node, "name": name},
    })
}

fn bitmap_merge_action(node: &str, target: &str, sources: &[String]) -> Value {
    let bitmaps: Vec<_> = sources.iter().map(|s| json!({"node": node, "name": s})).collect();
    json!({
        "type": "block-dirty-bitmap-merge",
        "data": {"node": node, "target": target, "bitmaps": bitmaps},
    })
}

fn blockdev_backup_action(
    device: &str,
    target: &str,
    job_id: &str,
    sync: &str,
    bitmap: Option<&str>,
    compress: bool,
    speed: u64,
) -> Value {
    let mut data = json!({
        "device": device,
        "target": target,
        "job-id": job_id,
        "sync": sync,
        "auto-dismiss": false,
        "compress": compress,
    });
    if let Some(name) = bitmap {
        data["bitmap"] = json!(name);
    }
    if speed > 0 {
        data["speed"] = json!(speed);
    }
    json!({"type": "blockdev-backup", "data": data})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(format: &str, has_bitmap: bool) -> BlockDev {
        BlockDev {
            device: "ide0-hd0".into(),
            node: "node0".into(),
            node_safe: "node0".into(),
            child_device: None,
            qdev: Some("/x".into()),
            filename: "/vms/disk".into(),
            format: format.into(),
            driver: None,
            backing_image: false,
            virtual_size: 1024,
            has_bitmap,
            bitmaps: vec![],
        }
    }

    fn opts(level: BackupLevel) -> TransactionOptions {
        TransactionOptions {
            level,
            uuid: "U".into(),
            no_persist: false,
            no_fleece: false,
            compress: true,
            speed_limit: 0,
        }
    }

    #[test]
    fn full_without_bitmap_adds_persistent_bitmap_then_backs_up() {
        let actions = build(&[dev("qcow2", false)], &opts(BackupLevel::Full));
        assert_eq!(actions[0]["type"], "block-dirty-bitmap-add");
        assert_eq!(actions[0]["data"]["persistent"], true);
        assert_eq!(actions[1]["type"], "blockdev-backup");
        assert_eq!(actions[1]["data"]["sync"], "full");
    }

    #[test]
    fn full_with_existing_bitmap_clears_it_instead_of_adding() {
        let actions = build(&[dev("qcow2", true)], &opts(BackupLevel::Full));
        assert_eq!(actions[0]["type"], "block-dirty-bitmap-clear");
    }

    #[test]
    fn copy_always_adds_an_ephemeral_bitmap() {
        let actions = build(&[dev("qcow2", true)], &opts(BackupLevel::Copy));
        assert_eq!(actions[0]["type"], "block-dirty-bitmap-add");
        assert_eq!(actions[0]["data"]["persistent"], false);
        assert!(actions[0]["data"]["name"].as_str().unwrap().starts_with("qmpbackup-copy-"));
    }

    #[test]
    fn raw_device_only_ever_gets_a_full_sync_backup() {
        let actions = build(&[dev("raw", false)], &opts(BackupLevel::Inc));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["data"]["sync"], "full");
        assert_eq!(actions[0]["data"]["compress"], false);
    }

    #[test]
    fn raw_device_also_gets_a_full_sync_backup_under_diff() {
        let actions = build(&[dev("raw", false)], &opts(BackupLevel::Diff));
        assert_eq!(actions.len(), 1, "a raw device must still get a job under --level diff");
        assert_eq!(actions[0]["data"]["sync"], "full");
    }

    #[test]
    fn a_mixed_device_set_never_leaves_a_raw_device_jobless_under_diff() {
        let devices = [dev("qcow2", true), dev("raw", false)];
        let actions = build(&devices, &opts(BackupLevel::Diff));
        let backups = actions.iter().filter(|a| a["type"] == "blockdev-backup").count();
        assert_eq!(backups, devices.len(), "every device must get exactly one backup job");
    }

    #[test]
    fn inc_with_fleecing_merges_into_snapshot_node_and_clears_source() {
        let actions = build(&[dev("qcow2", true)], &opts(BackupLevel::Inc));
        let types: Vec<_> = actions.iter().map(|a| a["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["block-dirty-bitmap-add", "block-dirty-bitmap-merge", "blockdev-backup", "block-dirty-bitmap-clear"]);
        assert_eq!(actions[2]["data"]["device"], "node0-snap");
    }

    #[test]
    fn diff_does_not_clear_the_source_bitmap() {
        let actions = build(&[dev("qcow2", true)], &opts(BackupLevel::Diff));
        assert!(!actions.iter().any(|a| a["type"] == "block-dirty-bitmap-clear"));
    }

    #[test]
    fn no_fleece_reads_incremental_backup_directly_off_the_device() {
        let mut o = opts(BackupLevel::Inc);
        o.no_fleece = true;
        let actions = build(&[dev("qcow2", true)], &o);
        let backup = actions.iter().find(|a| a["type"] == "blockdev-backup").unwrap();
        assert_eq!(backup["data"]["device"], "node0");
    }
}
