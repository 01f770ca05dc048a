//! Bitmap Registry (C8) — deterministic bitmap naming plus the ephemeral
//! bitmap sweep run after a `copy` backup (§4.6). Bitmap add/clear/merge for
//! `full`/`inc`/`diff` are issued as part of the atomic transaction built by
//! [`crate::transaction`], not through this registry.

use serde_json::json;
use tracing::warn;

use crate::error::MonitorError;
use crate::inventory::BlockDev;
use crate::level::BackupLevel;
use crate::monitor::MonitorClient;

/// Computes the deterministic bitmap name for `device` under `uuid` at
/// `level` (§3 invariant 2).
pub fn name_for(level: BackupLevel, device: &str, uuid: &str) -> String {
    match level {
        BackupLevel::Copy => format!("qmpbackup-copy-{device}-{uuid}"),
        _ => format!("qmpbackup-{device}-{uuid}"),
    }
}

/// Bitmap Registry operations, scoped to one monitor client.
#[derive(Debug, Clone, Copy)]
pub struct BitmapRegistry<'a> {
    client: &'a MonitorClient,
}

impl<'a> BitmapRegistry<'a> {
    /// Creates a registry bound to `client`.
    pub const fn new(client: &'a MonitorClient) -> Self {
        Self { client }
    }

    /// Removes every bitmap across `devices` whose name starts with
    /// `prefix` and, if `uuid` is given, also ends with it. Non-matching
    /// bitmaps are left intact and logged (§4.6).
    pub async fn remove_all(
        &self,
        devices: &[BlockDev],
        prefix: &str,
        uuid: Option<&str>,
    ) -> Result<(), MonitorError> {
        for dev in devices {
            for bitmap in &dev.bitmaps {
                let matches_prefix = bitmap.name.starts_with(prefix);
                let matches_uuid = uuid.is_none_or(|u| bitmap.name.ends_with(u));
                if !matches_prefix || !matches_uuid {
                    warn!(bitmap = bitmap.name, device = dev.device, "leaving non-matching bitmap intact");
                    continue;
                }
                self.client
                    .call(
                        "block-dirty-bitmap-remove",
                        Some(json!({"node": dev.bitmap_source_node(), "name": bitmap.name})),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_inc_share_a_name_scheme() {
        assert_eq!(name_for(BackupLevel::Full, "ide0-hd0", "U"), "qmpbackup-ide0-hd0-U");
        assert_eq!(name_for(BackupLevel::Inc, "ide0-hd0", "U"), "qmpbackup-ide0-hd0-U");
        assert_eq!(name_for(BackupLevel::Diff, "ide0-hd0", "U"), "qmpbackup-ide0-hd0-U");
    }

    #[test]
    fn copy_gets_a_distinct_ephemeral_name() {
        assert_eq!(name_for(BackupLevel::Copy, "ide0-hd0", "U"), "qmpbackup-copy-ide0-hd0-U");
    }
}
