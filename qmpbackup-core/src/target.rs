//! Target Provisioner (C4) — creates backup target and fleecing files on
//! disk with format-matched creation options (§4.2).

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Error;
use crate::image::{self, CreateOptions, ImageInfo};
use crate::inventory::BlockDev;
use crate::level::BackupLevel;

/// Knobs controlling where and how target/fleecing files are created.
#[derive(Debug, Clone)]
pub struct TargetOptions {
    /// Root backup directory.
    pub backupdir: PathBuf,
    /// Requested backup level, used in filenames.
    pub level: BackupLevel,
    /// Unix timestamp embedded in filenames, fixed for the whole run so
    /// every device's target shares one run identifier.
    pub timestamp: u64,
    /// Flatten the on-disk layout: no per-device subdirectory.
    pub no_subdir: bool,
    /// Omit the `{LEVEL}-{ts}-` prefix for `full`/`copy` targets.
    pub no_timestamp: bool,
    /// Skip fleecing file creation entirely.
    pub no_fleece: bool,
}

/// Files provisioned for one device ahead of a run.
#[derive(Debug, Clone)]
pub struct Target {
    /// `.partial` target path the backup job writes into.
    pub target_path: PathBuf,
    /// Fleecing scratch file path, `None` when `no_fleece` is set.
    pub fleece_path: Option<PathBuf>,
    /// `.config` snapshot of the source image's metadata.
    pub config_path: PathBuf,
}

fn basename(filename: &str) -> &str {
    Path::new(filename).file_name().and_then(|n| n.to_str()).unwrap_or(filename)
}

/// Computes the target path for `dev` without touching the filesystem.
pub fn target_path(dev: &BlockDev, opts: &TargetOptions) -> PathBuf {
    let base = basename(&dev.filename);
    let omit_prefix =
        opts.no_timestamp && matches!(opts.level, BackupLevel::Copy | BackupLevel::Full);
    let file_name = if omit_prefix {
        format!("{base}.partial")
    } else {
        format!("{}-{}-{base}.partial", opts.level.file_prefix(), opts.timestamp)
    };

    if opts.no_subdir {
        opts.backupdir.join(file_name)
    } else {
        opts.backupdir.join(&dev.device).join(file_name)
    }
}

/// Computes the fleecing file path for `dev`, alongside the source image.
pub fn fleece_path(dev: &BlockDev, opts: &TargetOptions) -> PathBuf {
    let file_name =
        format!("{}-{}-{}.fleece.{}", opts.level.file_prefix(), opts.timestamp, dev.device, dev.format);
    dev.path().join(file_name)
}

/// Creates the target file (and fleecing file, unless disabled) for one
/// device, inheriting creation options from its saved `.config`.
pub async fn provision(dev: &BlockDev, opts: &TargetOptions) -> Result<Target, Error> {
    let target = target_path(dev, opts);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let config_path = opts.backupdir.join(format!("{}.config", basename(&dev.filename)));
    let create_opts = if dev.format == "raw" {
        CreateOptions::default()
    } else {
        load_create_options(dev, &config_path).await?
    };

    image::create(&target, &dev.format, dev.virtual_size, &create_opts).await?;

    let fleece_path = if opts.no_fleece {
        None
    } else {
        let path = fleece_path(dev, opts);
        image::create(&path, &dev.format, dev.virtual_size, &create_opts).await?;
        Some(path)
    };

    Ok(Target { target_path: target, fleece_path, config_path })
}

/// Saves a fresh `ImageInfo` snapshot for `dev`'s source image into its
/// `.config` file, skipped for RBD-backed devices (§9: no local file to
/// introspect).
pub async fn save_config(dev: &BlockDev, backupdir: &Path) -> Result<(), Error> {
    if dev.driver.as_deref() == Some("rbd") {
        return Ok(());
    }
    let info = image::info(Path::new(&dev.filename)).await?;
    let config_path = backupdir.join(format!("{}.config", basename(&dev.filename)));
    info.save(&config_path)
}

async fn load_create_options(dev: &BlockDev, config_path: &Path) -> Result<CreateOptions, Error> {
    if !config_path.exists() {
        warn!(
            device = dev.device,
            path = %config_path.display(),
            "no saved .config for source image, creating target with defaults"
        );
        return Ok(CreateOptions::default());
    }
    let info = ImageInfo::load(config_path)?;
    Ok(CreateOptions {
        compat: info.compat().map(str::to_owned),
        cluster_size: info.cluster_size(),
        lazy_refcounts: info.lazy_refcounts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::BlockDev;

    fn dev(filename: &str) -> BlockDev {
        BlockDev {
            device: "ide0-hd0".into(),
            node: "node0".into(),
            node_safe: "node0".into(),
            child_device: None,
            qdev: Some("/x".into()),
            filename: filename.into(),
            format: "qcow2".into(),
            driver: None,
            backing_image: false,
            virtual_size: 1024,
            has_bitmap: false,
            bitmaps: vec![],
        }
    }

    #[test]
    fn target_path_includes_level_and_timestamp_by_default() {
        let opts = TargetOptions {
            backupdir: PathBuf::from("/backups"),
            level: BackupLevel::Full,
            timestamp: 1000,
            no_subdir: false,
            no_timestamp: false,
            no_fleece: false,
        };
        let path = target_path(&dev("/vms/disk.qcow2"), &opts);
        assert_eq!(path, PathBuf::from("/backups/ide0-hd0/FULL-1000-disk.qcow2.partial"));
    }

    #[test]
    fn no_subdir_flattens_the_path() {
        let opts = TargetOptions {
            backupdir: PathBuf::from("/backups"),
            level: BackupLevel::Inc,
            timestamp: 1000,
            no_subdir: true,
            no_timestamp: false,
            no_fleece: false,
        };
        let path = target_path(&dev("/vms/disk.qcow2"), &opts);
        assert_eq!(path, PathBuf::from("/backups/INC-1000-disk.qcow2.partial"));
    }

    #[test]
    fn no_timestamp_only_applies_to_full_and_copy() {
        let mut opts = TargetOptions {
            backupdir: PathBuf::from("/backups"),
            level: BackupLevel::Full,
            timestamp: 1000,
            no_subdir: true,
            no_timestamp: true,
            no_fleece: false,
        };
        let path = target_path(&dev("/vms/disk.qcow2"), &opts);
        assert_eq!(path, PathBuf::from("/backups/disk.qcow2.partial"));

        opts.level = BackupLevel::Inc;
        let path = target_path(&dev("/vms/disk.qcow2"), &opts);
        assert_eq!(path, PathBuf::from("/backups/INC-1000-disk.qcow2.partial"));
    }

    #[test]
    fn fleece_path_lives_alongside_source_image() {
        let opts = TargetOptions {
            backupdir: PathBuf::from("/backups"),
            level: BackupLevel::Full,
            timestamp: 1000,
            no_subdir: false,
            no_timestamp: false,
            no_fleece: false,
        };
        let path = fleece_path(&dev("/vms/disk.qcow2"), &opts);
        assert_eq!(path, PathBuf::from("/vms/FULL-1000-ide0-hd0.fleece.qcow2"));
    }
}
