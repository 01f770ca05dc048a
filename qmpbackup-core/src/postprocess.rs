//! Post-processing engine (C10) — folds a chain of incremental images back
//! into a single flat image after the fact, grounded on
//! `original_source/libqmpbackup/image.py`'s `rebase`/`merge`/`commit`/
//! `snapshot_rebase` (§4.8).
//!
//! None of these ever cache a chain's parent pointers between calls: every
//! entry point re-lists the directory and re-sorts by mtime (§9), so a
//! crashed run can always be resumed by re-invoking the same command.

use std::path::{Path, PathBuf};

use time_fallback::short_ctime;
use tracing::{error, info};

use crate::chain::{self, ChainEntry};
use crate::image;

/// Errors specific to post-processing, kept distinct from the run-level
/// [`crate::error::Error`] since these never touch the monitor (§7).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostProcessError {
    /// A chain precondition failed: stray `.partial`, missing base, unknown
    /// `until` marker, or a `targetfile` that already exists.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Filesystem I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An external image utility invocation failed.
    #[error(transparent)]
    Image(#[from] crate::error::Error),
}

type Result<T> = std::result::Result<T, PostProcessError>;

fn entries_up_to(dir: &Path, until: Option<&str>) -> Result<Vec<ChainEntry>> {
    if chain::has_partial(dir)? {
        return Err(PostProcessError::Configuration(format!(
            "{} still contains a .partial file from an in-progress run",
            dir.display()
        )));
    }
    let entries = chain::list_entries(dir)?;
    if !entries.first().is_some_and(ChainEntry::is_base) {
        return Err(PostProcessError::Configuration(format!(
            "{} has no FULL base image",
            dir.display()
        )));
    }

    let Some(marker) = until else { return Ok(entries) };
    let mut truncated = Vec::new();
    let mut found = false;
    for entry in entries {
        let matches = entry.path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n == marker);
        truncated.push(entry);
        if matches {
            found = true;
            break;
        }
    }
    if !found {
        return Err(PostProcessError::Configuration(format!(
            "no image in {} matched --until {marker:?}",
            dir.display()
        )));
    }
    Ok(truncated)
}

async fn maybe_check(path: &Path, skip_check: bool) -> Result<()> {
    if skip_check {
        return Ok(());
    }
    image::check(path).await?;
    Ok(())
}

fn symlink_image(dir: &Path, target: &Path) -> Result<()> {
    let link = dir.join("image");
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &link)?;
    Ok(())
}

/// Repoints each image in the chain at its immediate predecessor in place,
/// without rewriting data, stopping at `until` if given. Leaves `<dir>/image`
/// symlinked to the newest retained file on success.
pub async fn rebase(dir: &Path, until: Option<&str>, dry_run: bool, skip_check: bool) -> Result<()> {
    let entries = entries_up_to(dir, until)?;
    info!(dir = %dir.display(), count = entries.len(), dry_run, "rebasing chain");

    let mut previous: Option<PathBuf> = None;
    for entry in &entries {
        if !entry.is_base() {
            maybe_check(&entry.path, skip_check).await?;
            if let Some(backing) = &previous {
                if dry_run {
                    info!(path = %entry.path.display(), backing = %backing.display(), "dry-run: would rebase");
                } else {
                    image::rebase_unsafe(&entry.path, backing).await?;
                }
            }
        }
        previous = Some(entry.path.clone());
    }

    if !dry_run {
        if let Some(newest) = entries.last() {
            symlink_image(dir, &newest.path)?;
        }
    }
    Ok(())
}

/// Clones the base into `targetfile`, then folds each incremental into it
/// in turn (clone alongside, rebase onto the previous clone, commit),
/// stopping at `until`. Refuses if `targetfile` already exists.
pub async fn merge(
    dir: &Path,
    targetfile: &Path,
    until: Option<&str>,
    rate_limit: Option<u64>,
    skip_check: bool,
) -> Result<()> {
    let entries = entries_up_to(dir, until)?;
    if targetfile.exists() {
        return Err(PostProcessError::Configuration(format!(
            "{} already exists",
            targetfile.display()
        )));
    }

    let base = entries.first().ok_or_else(|| {
        PostProcessError::Configuration(format!("{} has no FULL base image", dir.display()))
    })?;
    info!(dir = %dir.display(), target = %targetfile.display(), count = entries.len(), "merging chain");

    image::clone(&base.path, targetfile).await?;
    let mut current = targetfile.to_path_buf();

    for entry in entries.iter().skip(1) {
        maybe_check(&entry.path, skip_check).await?;
        let scratch = current.with_extension("next");
        image::clone(&entry.path, &scratch).await?;
        image::rebase_unsafe(&scratch, &current).await?;
        image::commit(&scratch, rate_limit).await?;
        std::fs::rename(&scratch, &current)?;
    }
    Ok(())
}

/// Rebases each incremental onto the base in place and commits it into the
/// base, removing the incremental after a successful commit.
pub async fn commit(dir: &Path, until: Option<&str>, rate_limit: Option<u64>, skip_check: bool) -> Result<()> {
    let entries = entries_up_to(dir, until)?;
    let base = entries.first().ok_or_else(|| {
        PostProcessError::Configuration(format!("{} has no FULL base image", dir.display()))
    })?;
    info!(dir = %dir.display(), count = entries.len(), "committing chain into base");

    for entry in entries.iter().skip(1) {
        maybe_check(&entry.path, skip_check).await?;
        image::rebase_unsafe(&entry.path, &base.path).await?;
        if let Err(err) = image::commit(&entry.path, rate_limit).await {
            error!(path = %entry.path.display(), %err, "commit failed, leaving image in place");
            return Err(err.into());
        }
        std::fs::remove_file(&entry.path)?;
    }
    Ok(())
}

/// Like [`commit`], but takes an internal qcow2 snapshot of the base before
/// each commit, named from the incremental's embedded timestamp when its
/// filename starts with `INC`, else the file's modification time, so every
/// historical point stays recoverable inside the merged base image.
pub async fn snapshot_rebase(
    dir: &Path,
    until: Option<&str>,
    rate_limit: Option<u64>,
    skip_check: bool,
) -> Result<()> {
    let entries = entries_up_to(dir, until)?;
    let base = entries.first().ok_or_else(|| {
        PostProcessError::Configuration(format!("{} has no FULL base image", dir.display()))
    })?;
    info!(dir = %dir.display(), count = entries.len(), "snapshot-rebasing chain into base");

    for entry in entries.iter().skip(1) {
        maybe_check(&entry.path, skip_check).await?;
        let snapshot_name = snapshot_name_for(entry);
        if !image::snapshot_exists(&base.path, &snapshot_name).await? {
            image::snapshot_create(&base.path, &snapshot_name).await?;
        }
        image::rebase_unsafe(&entry.path, &base.path).await?;
        image::commit(&entry.path, rate_limit).await?;
        std::fs::remove_file(&entry.path)?;
    }
    Ok(())
}

fn snapshot_name_for(entry: &ChainEntry) -> String {
    let file_name = entry.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if let Some(rest) = file_name.strip_prefix("INC-") {
        if let Some(timestamp) = rest.split('-').next() {
            return timestamp.to_owned();
        }
    }
    short_ctime(entry.mtime)
}

/// Minimal mtime-to-label formatting, avoided as a full dependency since the
/// teacher's crates carry no datetime library; a unix timestamp is stable
/// and sortable, which is all a snapshot name needs to be.
mod time_fallback {
    use std::time::SystemTime;

    pub fn short_ctime(t: SystemTime) -> String {
        let secs = t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        format!("snap-{secs}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn entries_up_to_rejects_stray_partial() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        touch(dir.path(), "INC-2-disk.qcow2.partial");
        let err = entries_up_to(dir.path(), None).unwrap_err();
        assert!(matches!(err, PostProcessError::Configuration(_)));
    }

    #[test]
    fn entries_up_to_truncates_at_marker() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        touch(dir.path(), "INC-2-disk.qcow2");
        touch(dir.path(), "INC-3-disk.qcow2");
        let entries = entries_up_to(dir.path(), Some("INC-2-disk.qcow2")).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn entries_up_to_does_not_stop_early_on_a_marker_prefix_collision() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        touch(dir.path(), "INC-17-disk.qcow2");
        touch(dir.path(), "INC-1700000000-disk.qcow2");
        let entries = entries_up_to(dir.path(), Some("INC-17-disk.qcow2")).unwrap();
        assert_eq!(entries.len(), 2, "a substring match would also stop at INC-1700000000-disk.qcow2");
    }

    #[test]
    fn entries_up_to_rejects_unknown_marker() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        let err = entries_up_to(dir.path(), Some("nope")).unwrap_err();
        assert!(matches!(err, PostProcessError::Configuration(_)));
    }

    #[test]
    fn snapshot_name_prefers_embedded_inc_timestamp() {
        let entry = ChainEntry {
            path: PathBuf::from("/chain/INC-1700000000-disk.qcow2"),
            level: Some(crate::level::BackupLevel::Inc),
            is_partial: false,
            mtime: std::time::SystemTime::UNIX_EPOCH,
        };
        assert_eq!(snapshot_name_for(&entry), "1700000000");
    }
}
