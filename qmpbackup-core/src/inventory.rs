//! Device Inventory (C3) — turns `query-block` / `query-named-block-nodes`
//! results into the ordered set of eligible [`BlockDev`] records.
//!
//! `discover` takes already-fetched query results rather than a live
//! [`crate::monitor::MonitorClient`] so the selection rules (§4.1) are
//! testable against fixture JSON without a socket.

use serde_json::Value;
use tracing::warn;

/// One dirty bitmap reported on a device or its child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Bitmap name, e.g. `qmpbackup-ide0-hd0-<uuid>`.
    pub name: String,
    /// `status` field on historic hypervisors (`"active"`, `"frozen"`, …),
    /// when present.
    pub status: Option<String>,
    /// `recording` boolean on newer hypervisors, when present. Per the
    /// open design question, both fields are accepted and neither implies
    /// the other is absent.
    pub recording: Option<bool>,
    /// Whether the bitmap survives hypervisor restarts.
    pub persistent: bool,
    /// Bitmap granularity in bytes.
    pub granularity: u64,
}

/// One eligible guest disk, as selected by the inventory rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDev {
    /// Stable guest-facing device identifier (`ide0-hd0`).
    pub device: String,
    /// Monitor node name for the top-level block node.
    pub node: String,
    /// `node` with any leading `#`-reserved prefix stripped.
    pub node_safe: String,
    /// Inner node name when the top node is a snapshot wrapper.
    pub child_device: Option<String>,
    /// QOM path used to rewire the drive during fleecing.
    pub qdev: Option<String>,
    /// Backing storage path or RBD image name.
    pub filename: String,
    /// Image format (`"raw"`, `"qcow2"`, …).
    pub format: String,
    /// Driver name, e.g. `Some("rbd")`, or `None` for local files.
    pub driver: Option<String>,
    /// Whether the image has a backing file.
    pub backing_image: bool,
    /// Reported virtual size in bytes.
    pub virtual_size: u64,
    /// Whether this device carries any qualifying bitmap.
    pub has_bitmap: bool,
    /// Bitmaps found on the selected bitmap source (child or device node).
    pub bitmaps: Vec<Bitmap>,
}

impl BlockDev {
    /// Directory containing [`Self::filename`], or `.` if it has no parent.
    pub fn path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.filename)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| std::path::PathBuf::from("."), std::path::Path::to_path_buf)
    }

    /// Node used for reads during backup: the child node when present,
    /// else the top-level node (§4.1 bitmap source selection, also used
    /// for the CBW filter's `file` parameter).
    pub fn bitmap_source_node(&self) -> &str {
        self.child_device.as_deref().unwrap_or(&self.node)
    }
}

/// Selection knobs for [`discover`].
#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    /// Device/node names to include exclusively; empty means "all".
    pub include: Vec<String>,
    /// Device/node names to exclude.
    pub exclude: Vec<String>,
    /// Whether `raw`-format devices are eligible.
    pub include_raw: bool,
    /// Backup-chain UUID used to decide `has_bitmap`; `None` for a first
    /// full backup where no chain exists yet.
    pub uuid: Option<String>,
}

/// Builds the ordered list of eligible [`BlockDev`] records from
/// `query-block` and `query-named-block-nodes` results.
pub fn discover(
    blocks: &[Value],
    named_nodes: &[Value],
    opts: &InventoryOptions,
) -> Vec<BlockDev> {
    let mut result = Vec::new();

    for device in blocks {
        let Some(inserted) = device.get("inserted") else {
            tracing::debug!(?device, "ignoring device with no inserted medium");
            continue;
        };

        let device_name = device["device"].as_str().unwrap_or_default();
        if device_name.starts_with("pflash") {
            continue;
        }

        let format = inserted["image"]["format"].as_str().unwrap_or_default().to_owned();
        if format == "raw" && !opts.include_raw {
            warn!(device = device_name, "excluding raw-format device from backup");
            continue;
        }

        let node = inserted["node-name"].as_str().unwrap_or_default().to_owned();
        if node.is_empty() {
            warn!(device = device_name, "device has no node-name, skipping");
            continue;
        }
        let node_safe = node.trim_start_matches('#').to_owned();

        let child_device = inserted
            .get("children")
            .and_then(Value::as_array)
            .and_then(|children| children.first())
            .and_then(|child| child["node-name"].as_str())
            .filter(|name| !name.starts_with('#'))
            .map(str::to_owned);

        let Some(filename) = resolve_filename(&inserted["image"]["filename"], device_name) else {
            continue;
        };

        let device_id = if device_name.is_empty() {
            inserted["node-name"].as_str().map(str::to_owned)
        } else {
            Some(device_name.to_owned())
        };
        let Some(device_id) = device_id else {
            warn!(node, "device has neither a device id nor a node-name, skipping");
            continue;
        };

        let qdev = device["qdev"].as_str().map(str::to_owned);
        let backing_image = inserted["image"].get("backing-image").is_some();
        if qdev.is_none() && !backing_image {
            warn!(device = device_id, "device has no qdev and is not a backing image, skipping");
            continue;
        }

        if !passes_filter(&device_id, &node, opts) {
            continue;
        }

        let bitmap_source =
            find_named_node(named_nodes, child_device.as_deref().unwrap_or(&node));
        let bitmaps = bitmap_source
            .and_then(|n| n.get("dirty-bitmaps"))
            .or_else(|| inserted.get("dirty-bitmaps"))
            .or_else(|| device.get("dirty-bitmaps"))
            .and_then(Value::as_array)
            .map(|arr| parse_bitmaps(arr))
            .unwrap_or_default();

        let has_bitmap = match &opts.uuid {
            Some(uuid) => bitmaps.iter().any(|b| b.name.ends_with(uuid.as_str())),
            None => !bitmaps.is_empty(),
        };

        result.push(BlockDev {
            device: device_id,
            node,
            node_safe,
            child_device,
            qdev,
            filename,
            format,
            driver: inserted["image"]["driver"].as_str().map(str::to_owned),
            backing_image,
            virtual_size: inserted["image"]["virtual-size"].as_u64().unwrap_or(0),
            has_bitmap,
            bitmaps,
        });
    }

    result
}

fn passes_filter(device: &str, node: &str, opts: &InventoryOptions) -> bool {
    let matches = |list: &[String]| list.iter().any(|p| p == device || p == node);
    if !opts.include.is_empty() && !matches(&opts.include) {
        return false;
    }
    if matches(&opts.exclude) {
        return false;
    }
    true
}

fn find_named_node<'a>(named_nodes: &'a [Value], node_name: &str) -> Option<&'a Value> {
    named_nodes.iter().find(|n| n["node-name"] == node_name)
}

fn parse_bitmaps(raw: &[Value]) -> Vec<Bitmap> {
    raw.iter()
        .filter_map(|b| {
            let Some(name) = b["name"].as_str() else {
                warn!("ignoring bitmap with no name field");
                return None;
            };
            Some(Bitmap {
                name: name.to_owned(),
                status: b["status"].as_str().map(str::to_owned),
                recording: b["recording"].as_bool(),
                persistent: b["persistent"].as_bool().unwrap_or(false),
                granularity: b["granularity"].as_u64().unwrap_or(0),
            })
        })
        .collect()
}

/// Resolves a raw `filename` field, unwrapping the `json:{...}` form used
/// for network-backed images (§4.1, §9 RBD note).
fn resolve_filename(raw: &Value, device_name: &str) -> Option<String> {
    let raw = raw.as_str()?;
    if let Some(rest) = raw.strip_prefix("json:") {
        let parsed: Value = match serde_json::from_str(rest) {
            Ok(v) => v,
            Err(err) => {
                warn!(device = device_name, %err, "malformed json: filename, skipping device");
                return None;
            }
        };
        if parsed["file"]["driver"] == "rbd" {
            return parsed["file"]["image"].as_str().map(str::to_owned).or_else(|| {
                warn!(device = device_name, "rbd json: filename missing file.image, skipping");
                None
            });
        }
        return parsed["file"]["next"]["filename"].as_str().map(str::to_owned).or_else(|| {
            warn!(
                device = device_name,
                "json: filename missing file.next.filename, skipping"
            );
            None
        });
    }
    Some(raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_device() -> Value {
        json!({
            "device": "ide0-hd0",
            "qdev": "/machine/peripheral/ide0-hd0/virtio-backend",
            "inserted": {
                "node-name": "node0",
                "image": {
                    "filename": "/var/lib/vms/disk.qcow2",
                    "format": "qcow2",
                    "virtual-size": 10_737_418_240u64,
                },
            },
        })
    }

    #[test]
    fn discovers_a_plain_qcow2_device() {
        let blocks = vec![sample_device()];
        let devs = discover(&blocks, &[], &InventoryOptions::default());
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[0].device, "ide0-hd0");
        assert_eq!(devs[0].filename, "/var/lib/vms/disk.qcow2");
        assert!(!devs[0].has_bitmap);
    }

    #[test]
    fn skips_raw_unless_include_raw_set() {
        let mut dev = sample_device();
        dev["inserted"]["image"]["format"] = json!("raw");
        let blocks = vec![dev.clone()];

        assert!(discover(&blocks, &[], &InventoryOptions::default()).is_empty());

        let opts = InventoryOptions { include_raw: true, ..Default::default() };
        assert_eq!(discover(&blocks, &[], &opts).len(), 1);
    }

    #[test]
    fn skips_pflash_even_with_include_raw() {
        let mut dev = sample_device();
        dev["device"] = json!("pflash0");
        dev["inserted"]["image"]["format"] = json!("raw");
        let opts = InventoryOptions { include_raw: true, ..Default::default() };
        assert!(discover(&[dev], &[], &opts).is_empty());
    }

    #[test]
    fn skips_device_with_no_inserted_medium() {
        let dev = json!({"device": "ide1-cd0", "qdev": "/x"});
        assert!(discover(&[dev], &[], &InventoryOptions::default()).is_empty());
    }

    #[test]
    fn skips_device_with_no_qdev_unless_backing_image() {
        let mut dev = sample_device();
        dev["qdev"] = Value::Null;
        assert!(discover(&[dev.clone()], &[], &InventoryOptions::default()).is_empty());

        dev["inserted"]["image"]["backing-image"] = json!(true);
        assert_eq!(discover(&[dev], &[], &InventoryOptions::default()).len(), 1);
    }

    #[test]
    fn resolves_rbd_json_filename() {
        let mut dev = sample_device();
        dev["inserted"]["image"]["filename"] = json!(
            "json:{\"file\": {\"driver\": \"rbd\", \"image\": \"pool/vol\"}}"
        );
        let devs = discover(&[dev], &[], &InventoryOptions::default());
        assert_eq!(devs[0].filename, "pool/vol");
    }

    #[test]
    fn has_bitmap_requires_matching_uuid_when_given() {
        let mut dev = sample_device();
        dev["inserted"]["dirty-bitmaps"] = json!([
            {"name": "qmpbackup-ide0-hd0-aaaa", "persistent": true, "granularity": 65536}
        ]);

        let opts = InventoryOptions { uuid: Some("bbbb".into()), ..Default::default() };
        assert!(!discover(&[dev.clone()], &[], &opts)[0].has_bitmap);

        let opts = InventoryOptions { uuid: Some("aaaa".into()), ..Default::default() };
        assert!(discover(&[dev], &[], &opts)[0].has_bitmap);
    }

    #[test]
    fn include_exclude_filters_apply_to_device_and_node() {
        let blocks = vec![sample_device()];
        let opts = InventoryOptions { exclude: vec!["ide0-hd0".into()], ..Default::default() };
        assert!(discover(&blocks, &[], &opts).is_empty());
    }

    #[test]
    fn prefers_child_node_bitmaps_over_device_bitmaps() {
        let mut dev = sample_device();
        dev["inserted"]["children"] = json!([{"node-name": "child0"}]);
        dev["inserted"]["dirty-bitmaps"] = json!([
            {"name": "qmpbackup-ide0-hd0-wrong", "persistent": true, "granularity": 65536}
        ]);
        let named = vec![json!({
            "node-name": "child0",
            "dirty-bitmaps": [{"name": "qmpbackup-ide0-hd0-right", "persistent": true, "granularity": 65536}]
        })];

        let devs = discover(&[dev], &named, &InventoryOptions::default());
        assert_eq!(devs[0].child_device.as_deref(), Some("child0"));
        assert_eq!(devs[0].bitmaps[0].name, "qmpbackup-ide0-hd0-right");
    }
}
