//! Fleecing Controller (C7) — attaches the target/fleece/CBW/snapshot-access
//! node chain and redirects the guest's qdev to it, then tears the whole
//! chain down in reverse, unconditionally and idempotently, on every exit
//! path (§4.4).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde_json::json;
use tracing::warn;

use crate::error::{Error, MonitorError};
use crate::inventory::BlockDev;
use crate::monitor::MonitorClient;
use crate::names;

/// AIO backend requested for attached target/fleece file children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AioMode {
    /// POSIX thread-pool AIO.
    Threads,
    /// Linux native AIO (`io_submit`).
    Native,
    /// `io_uring`.
    IoUring,
}

impl fmt::Display for AioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Threads => "threads",
            Self::Native => "native",
            Self::IoUring => "io_uring",
        };
        f.write_str(s)
    }
}

/// Error returned by [`AioMode::from_str`] for an unrecognized mode.
#[derive(Debug, thiserror::Error)]
#[error("unknown aio mode {0:?}, expected one of threads|native|io_uring")]
pub struct ParseAioModeError(String);

impl FromStr for AioMode {
    type Err = ParseAioModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threads" => Ok(Self::Threads),
            "native" => Ok(Self::Native),
            "io_uring" => Ok(Self::IoUring),
            other => Err(ParseAioModeError(other.to_owned())),
        }
    }
}

/// Knobs for how the attached nodes' file children are configured.
#[derive(Debug, Clone, Copy)]
pub struct FleecingOptions {
    /// AIO backend for target/fleece file children.
    pub aio: AioMode,
    /// Disable the host page cache on attached file children.
    pub disable_cache: bool,
}

impl Default for FleecingOptions {
    fn default() -> Self {
        Self { aio: AioMode::Threads, disable_cache: false }
    }
}

/// State machine driving one device's fleecing lifecycle (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    TargetAttached,
    FleeceAttached,
    CbwAttached,
    QdevSwitched,
    SnapAttached,
}

/// Owns the attach/detach lifecycle of the fleecing node chain for one
/// device across one run.
#[derive(Debug)]
pub struct FleecingSession {
    target_node: String,
    fleece_node: String,
    cbw_node: String,
    snap_node: String,
    qdev: Option<String>,
    original_drive: Option<String>,
    state: State,
}

impl FleecingSession {
    /// Creates a session for `dev`, deriving every transient node name
    /// from its monitor node.
    pub fn new(dev: &BlockDev) -> Self {
        let bitmap_node = dev.bitmap_source_node().to_owned();
        Self {
            target_node: names::target_node(&dev.node_safe),
            fleece_node: names::fleece_node(&bitmap_node),
            cbw_node: names::cbw_node(&bitmap_node),
            snap_node: names::snapshot_access_node(&bitmap_node),
            qdev: dev.qdev.clone(),
            original_drive: Some(bitmap_node),
            state: State::Idle,
        }
    }

    /// Node the backup job should read from: the snapshot-access node.
    pub fn read_node(&self) -> &str {
        &self.snap_node
    }

    /// Node the backup job should write to.
    pub fn target_node(&self) -> &str {
        &self.target_node
    }

    /// Runs the full attach sequence (§4.4 steps 1-5). On any failure,
    /// tears down everything attached so far before returning the error.
    pub async fn attach(
        &mut self,
        client: &MonitorClient,
        dev: &BlockDev,
        target_path: &Path,
        fleece_path: &Path,
        bind_bitmap: Option<&str>,
        opts: FleecingOptions,
    ) -> Result<(), Error> {
        if let Err(err) = self.attach_inner(client, dev, target_path, fleece_path, bind_bitmap, opts).await {
            self.teardown(client).await;
            return Err(err);
        }
        Ok(())
    }

    async fn attach_inner(
        &mut self,
        client: &MonitorClient,
        dev: &BlockDev,
        target_path: &Path,
        fleece_path: &Path,
        bind_bitmap: Option<&str>,
        opts: FleecingOptions,
    ) -> Result<(), Error> {
        let file_opts = |path: &Path| {
            json!({
                "driver": "file",
                "filename": path.to_string_lossy(),
                "aio": opts.aio.to_string(),
                "cache": {"direct": opts.disable_cache},
            })
        };

        client
            .call(
                "blockdev-add",
                Some(json!({
                    "node-name": self.target_node,
                    "driver": dev.format,
                    "file": file_opts(target_path),
                })),
            )
            .await?;
        self.state = State::TargetAttached;

        client
            .call(
                "blockdev-add",
                Some(json!({
                    "node-name": self.fleece_node,
                    "driver": dev.format,
                    "file": file_opts(fleece_path),
                })),
            )
            .await?;
        self.state = State::FleeceAttached;

        let mut cbw_data = json!({
            "node-name": self.cbw_node,
            "driver": "copy-before-write",
            "file": self.original_drive,
            "target": self.fleece_node,
            "on-cbw-error": "break-snapshot",
            "cbw-timeout": 45,
        });
        if let Some(name) = bind_bitmap {
            cbw_data["bitmap"] = json!({"node": self.original_drive, "name": name});
        }
        client.call("blockdev-add", Some(cbw_data)).await?;
        self.state = State::CbwAttached;

        if let Some(qdev) = &self.qdev {
            client
                .call(
                    "qom-set",
                    Some(json!({"path": qdev, "property": "drive", "value": self.cbw_node})),
                )
                .await?;
        }
        self.state = State::QdevSwitched;

        client
            .call(
                "blockdev-add",
                Some(json!({
                    "node-name": self.snap_node,
                    "driver": "snapshot-access",
                    "file": self.cbw_node,
                })),
            )
            .await?;
        self.state = State::SnapAttached;

        Ok(())
    }

    /// Reverses whatever was attached, tolerating "node not present" at
    /// every step (§4.4, §9 signal-safe teardown). Safe to call more than
    /// once and safe to call from a signal handler's unwind path.
    pub async fn teardown(&mut self, client: &MonitorClient) {
        if self.state >= State::SnapAttached {
            best_effort(client.call("blockdev-del", Some(json!({"node-name": self.snap_node}))).await);
        }
        if self.state >= State::QdevSwitched {
            if let Some(qdev) = &self.qdev {
                if let Some(original) = &self.original_drive {
                    best_effort(
                        client
                            .call(
                                "qom-set",
                                Some(json!({"path": qdev, "property": "drive", "value": original})),
                            )
                            .await,
                    );
                }
            }
        }
        if self.state >= State::CbwAttached {
            best_effort(client.call("blockdev-del", Some(json!({"node-name": self.cbw_node}))).await);
        }
        if self.state >= State::FleeceAttached {
            best_effort(client.call("blockdev-del", Some(json!({"node-name": self.fleece_node}))).await);
        }
        if self.state >= State::TargetAttached {
            best_effort(client.call("blockdev-del", Some(json!({"node-name": self.target_node}))).await);
        }
        self.state = State::Idle;
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        rank(*self).cmp(&rank(*other))
    }
}

const fn rank(state: State) -> u8 {
    match state {
        State::Idle => 0,
        State::TargetAttached => 1,
        State::FleeceAttached => 2,
        State::CbwAttached => 3,
        State::QdevSwitched => 4,
        State::SnapAttached => 5,
    }
}

fn best_effort(result: Result<serde_json::Value, MonitorError>) {
    if let Err(err) = result {
        warn!(%err, "teardown step failed, continuing (tolerating node-not-present)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_matches_attach_sequence() {
        assert!(State::Idle < State::TargetAttached);
        assert!(State::TargetAttached < State::SnapAttached);
    }

    #[test]
    fn aio_mode_round_trips() {
        for mode in [AioMode::Threads, AioMode::Native, AioMode::IoUring] {
            let parsed: AioMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
    }
}
