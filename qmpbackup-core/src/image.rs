//! Wraps the external image utilities (`image-info`, `image-create`,
//! `image-check`, `image-rebase`, `image-commit`, `image-snapshot`) as
//! opaque subprocesses, concretely `qemu-img` — the tool both the original
//! implementation and the wider ecosystem use for this (§1, §6).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Error;

/// Name of the external binary invoked for every image operation.
const IMAGE_TOOL: &str = "qemu-img";

/// Subset of `qemu-img info --output json` consumed when provisioning a
/// new target (§4.2), plus the raw payload so it can be persisted
/// verbatim into a device's `.config` file (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image format (`"qcow2"`, `"raw"`, …).
    pub format: String,
    /// Reported virtual size in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    /// Full JSON payload, kept so future fields survive a round-trip.
    #[serde(flatten)]
    pub raw: Value,
}

impl ImageInfo {
    /// `qemu-img create` compat string, when present under
    /// `format-specific.data.compat`.
    pub fn compat(&self) -> Option<&str> {
        self.raw["format-specific"]["data"]["compat"].as_str()
    }

    /// Cluster size, when reported.
    pub fn cluster_size(&self) -> Option<u64> {
        self.raw["cluster-size"].as_u64()
    }

    /// `lazy-refcounts` flag, when reported.
    pub fn lazy_refcounts(&self) -> Option<bool> {
        self.raw["format-specific"]["data"]["lazy-refcounts"].as_bool()
    }

    /// Persists this record as a device's `.config` file.
    pub fn save(&self, config_path: &Path) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(&self.raw)?;
        std::fs::write(config_path, json)?;
        Ok(())
    }

    /// Loads a previously saved `.config` file.
    pub fn load(config_path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(config_path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Runs `qemu-img info --output json --force-share` against `path`.
pub async fn info(path: &Path) -> Result<ImageInfo, Error> {
    let output = run(&["info", "--output", "json", "--force-share", &path.to_string_lossy()])
        .await?;
    Ok(serde_json::from_slice(&output)?)
}

/// Options controlling `qemu-img create` for a new target or fleecing
/// file (§4.2).
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// `compat=` value inherited from the source image's `.config`.
    pub compat: Option<String>,
    /// `cluster_size=` value inherited from the source image's `.config`.
    pub cluster_size: Option<u64>,
    /// `lazy_refcounts=` value inherited from the source image's `.config`.
    pub lazy_refcounts: Option<bool>,
}

/// Creates a new image at `path` with `format` and `size_bytes`. Raw
/// targets only ever receive `size` (§4.2); qcow2 targets pass through
/// whatever of `options` is present, warning on anything missing.
pub async fn create(
    path: &Path,
    format: &str,
    size_bytes: u64,
    options: &CreateOptions,
) -> Result<(), Error> {
    if path.exists() {
        return Err(Error::Configuration(format!("target {} already exists", path.display())));
    }

    let mut opt_parts = Vec::new();
    if format != "raw" {
        match &options.compat {
            Some(v) => opt_parts.push(format!("compat={v}")),
            None => warn!(path = %path.display(), "source image had no compat option to inherit"),
        }
        if let Some(v) = options.cluster_size {
            opt_parts.push(format!("cluster_size={v}"));
        } else {
            warn!(path = %path.display(), "source image had no cluster_size option to inherit");
        }
        if let Some(v) = options.lazy_refcounts {
            opt_parts.push(format!("lazy_refcounts={v}"));
        }
    }

    let mut args = vec!["create".to_owned(), "-f".to_owned(), format.to_owned()];
    if !opt_parts.is_empty() {
        args.push("-o".to_owned());
        args.push(opt_parts.join(","));
    }
    args.push(path.to_string_lossy().into_owned());
    args.push(size_bytes.to_string());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run(&arg_refs).await?;
    Ok(())
}

/// Runs `qemu-img check` against `path`.
pub async fn check(path: &Path) -> Result<(), Error> {
    run(&["check", &path.to_string_lossy()]).await?;
    Ok(())
}

/// `qemu-img rebase -u -b <backing> <path>`: repoints `path`'s backing
/// file without rewriting any data (§4.8).
pub async fn rebase_unsafe(path: &Path, backing_file: &Path) -> Result<(), Error> {
    run(&[
        "rebase",
        "-f",
        "qcow2",
        "-F",
        "qcow2",
        "-u",
        "-b",
        &backing_file.to_string_lossy(),
        &path.to_string_lossy(),
    ])
    .await?;
    Ok(())
}

/// `qemu-img commit [-r rate] <path>`: merges `path` into its backing
/// file and leaves `path` an empty overlay.
pub async fn commit(path: &Path, rate_limit: Option<u64>) -> Result<(), Error> {
    let mut args = vec!["commit".to_owned()];
    if let Some(rate) = rate_limit {
        args.push("-r".to_owned());
        args.push(rate.to_string());
    }
    args.push(path.to_string_lossy().into_owned());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run(&arg_refs).await?;
    Ok(())
}

/// `qemu-img snapshot -c <name> <path>`: creates a named internal
/// snapshot (used by `snapshot-rebase`, §4.8).
pub async fn snapshot_create(path: &Path, name: &str) -> Result<(), Error> {
    run(&["snapshot", "-c", name, &path.to_string_lossy()]).await?;
    Ok(())
}

/// `qemu-img snapshot -l <path>`, checking whether `name` is already
/// present.
pub async fn snapshot_exists(path: &Path, name: &str) -> Result<bool, Error> {
    let output = run(&["snapshot", "-l", &path.to_string_lossy()]).await?;
    let listing = String::from_utf8_lossy(&output);
    Ok(listing.lines().any(|line| line.split_whitespace().nth(1) == Some(name)))
}

/// Clones `source` to `target`, failing if `target` already exists
/// (`merge`'s first step, §4.8).
pub async fn clone(source: &Path, target: &Path) -> Result<(), Error> {
    if target.exists() {
        return Err(Error::Configuration(format!("{} already exists", target.display())));
    }
    tokio::fs::copy(source, target).await?;
    Ok(())
}

async fn run(args: &[&str]) -> Result<Vec<u8>, Error> {
    debug!(tool = IMAGE_TOOL, ?args, "invoking image utility");
    let output = Command::new(IMAGE_TOOL).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Configuration(format!(
            "{IMAGE_TOOL} {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}
