//! Backup Chain / Image Store (C9) — on-disk layout of a backup directory:
//! the write-once `uuid` file, per-device image directories, and the
//! `.partial` → final rename protocol (§3, §6, §9).
//!
//! Chain state is never cached: every call re-derives the file listing
//! from the filesystem, mirroring the historic tool's behavior of never
//! storing backing-file pointers in memory (§9).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Error;
use crate::level::BackupLevel;

/// One image file found in a device's chain directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    /// Full path of the image file.
    pub path: PathBuf,
    /// Level parsed from the filename prefix, if any (a base image under
    /// no-subdir mode with no prefix has `level = None`).
    pub level: Option<BackupLevel>,
    /// Whether the file still carries the `.partial` suffix.
    pub is_partial: bool,
    /// Modification time, used to order the chain.
    pub mtime: SystemTime,
}

impl ChainEntry {
    fn from_path(path: PathBuf) -> std::io::Result<Self> {
        let mtime = fs::metadata(&path)?.modified()?;
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let is_partial = file_name.ends_with(".partial");
        let stem = file_name.strip_suffix(".partial").unwrap_or(file_name);
        let level = ["FULL", "INC", "DIFF", "COPY"]
            .iter()
            .find(|prefix| stem.starts_with(*prefix))
            .and_then(|prefix| match *prefix {
                "FULL" => Some(BackupLevel::Full),
                "INC" => Some(BackupLevel::Inc),
                "DIFF" => Some(BackupLevel::Diff),
                "COPY" => Some(BackupLevel::Copy),
                _ => None,
            });
        Ok(Self { path, level, is_partial, mtime })
    }

    /// Whether this entry is a chain base image: `FULL-` prefixed, or
    /// unprefixed under no-subdir mode (§3 invariant 1).
    pub fn is_base(&self) -> bool {
        matches!(self.level, Some(BackupLevel::Full) | None)
    }
}

/// Lists every regular file directly inside `dir`, sorted oldest-first by
/// mtime (never by filename — timestamps embedded in names are advisory).
pub fn list_entries(dir: &Path) -> std::io::Result<Vec<ChainEntry>> {
    let mut entries = Vec::new();
    for item in fs::read_dir(dir)? {
        let item = item?;
        if !item.file_type()?.is_file() {
            continue;
        }
        entries.push(ChainEntry::from_path(item.path())?);
    }
    entries.sort_by_key(|e| e.mtime);
    Ok(entries)
}

/// Whether any `.partial` file remains in `dir` — blocks all
/// post-processing subcommands and is also invariant 1's negative clause.
pub fn has_partial(dir: &Path) -> std::io::Result<bool> {
    Ok(list_entries(dir)?.iter().any(|e| e.is_partial))
}

/// Validates that `dir` holds a complete, non-in-progress chain: a base
/// image is present and no `.partial` file remains.
pub fn validate(dir: &Path) -> Result<Vec<ChainEntry>, Error> {
    let entries = list_entries(dir)?;
    if entries.iter().any(|e| e.is_partial) {
        return Err(Error::Configuration(format!(
            "{} still contains a .partial file from an in-progress run",
            dir.display()
        )));
    }
    if !entries.first().is_some_and(ChainEntry::is_base) {
        return Err(Error::Configuration(format!(
            "{} has no FULL base image",
            dir.display()
        )));
    }
    Ok(entries)
}

/// Atomically renames `path` to itself without its `.partial` suffix.
pub fn partial_to_final(path: &Path) -> std::io::Result<PathBuf> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let final_name = file_name.strip_suffix(".partial").unwrap_or(file_name);
    let final_path = path.with_file_name(final_name);
    fs::rename(path, &final_path)?;
    Ok(final_path)
}

/// Owns the top-level backup directory's write-once `uuid` file, which
/// ties every device's chain inside it to one set of bitmaps (§3, §4.6).
#[derive(Debug, Clone)]
pub struct BackupChain {
    dir: PathBuf,
}

impl BackupChain {
    /// Binds to `dir` without touching the filesystem.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn uuid_path(&self) -> PathBuf {
        self.dir.join("uuid")
    }

    /// Reads the chain UUID, if the directory has ever run a `full` backup.
    pub fn uuid(&self) -> std::io::Result<Option<String>> {
        match fs::read_to_string(self.uuid_path()) {
            Ok(contents) => Ok(Some(contents.trim().to_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns the existing UUID, or creates and persists a new one. Only
    /// ever called on a `full` backup's first run into a fresh directory —
    /// the file is never rewritten afterward.
    pub fn ensure_uuid(&self) -> std::io::Result<String> {
        if let Some(existing) = self.uuid()? {
            return Ok(existing);
        }
        let fresh = uuid::Uuid::new_v4().simple().to_string();
        fs::create_dir_all(&self.dir)?;
        fs::write(self.uuid_path(), &fresh)?;
        Ok(fresh)
    }

    /// Per-device image directory, honoring `no_subdir`.
    pub fn device_dir(&self, device: &str, no_subdir: bool) -> PathBuf {
        if no_subdir { self.dir.clone() } else { self.dir.join(device) }
    }

    /// Root backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
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
    fn validate_rejects_missing_base() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "INC-1-disk.qcow2");
        let err = validate(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn validate_rejects_stray_partial() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        touch(dir.path(), "INC-2-disk.qcow2.partial");
        let err = validate(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn validate_accepts_a_clean_chain() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "FULL-1-disk.qcow2");
        touch(dir.path(), "INC-2-disk.qcow2");
        let entries = validate(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_base());
    }

    #[test]
    fn ensure_uuid_is_write_once() {
        let dir = tempdir().unwrap();
        let chain = BackupChain::open(dir.path());
        let first = chain.ensure_uuid().unwrap();
        let second = chain.ensure_uuid().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn partial_to_final_strips_suffix() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("FULL-1-disk.qcow2.partial");
        File::create(&partial).unwrap();
        let final_path = partial_to_final(&partial).unwrap();
        assert_eq!(final_path, dir.path().join("FULL-1-disk.qcow2"));
        assert!(final_path.exists());
    }
}
