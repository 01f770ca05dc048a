//! The four backup levels a run can take (§3, §4.3).

use std::fmt;
use std::str::FromStr;

/// Backup level requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupLevel {
    /// Full copy of the device into a fresh target, persistent bitmap
    /// created (unless `no_persist`).
    Full,
    /// Incremental: only blocks dirtied since the last `full`/`inc` are
    /// copied; the device's bitmap is cleared on success.
    Inc,
    /// Differential: structurally identical to `Inc`, but per the open
    /// design question (§9) the bitmap is *not* cleared, so each `diff`
    /// captures everything written since the last `full`.
    Diff,
    /// Ephemeral copy: behaves like `full` but binds a throwaway bitmap
    /// suffixed with the level name instead of the chain's persistent one.
    Copy,
}

impl BackupLevel {
    /// Filename prefix used for target files (§6 on-disk layout).
    pub const fn file_prefix(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Inc => "INC",
            Self::Diff => "DIFF",
            Self::Copy => "COPY",
        }
    }

    /// Whether this level clears the device's bitmap on success.
    pub const fn clears_bitmap_on_success(self) -> bool {
        matches!(self, Self::Inc)
    }

    /// Whether this level requires an existing chain with a prior `full`.
    pub const fn requires_existing_chain(self) -> bool {
        matches!(self, Self::Inc | Self::Diff)
    }
}

impl fmt::Display for BackupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Inc => "inc",
            Self::Diff => "diff",
            Self::Copy => "copy",
        };
        f.write_str(s)
    }
}

/// Error returned by [`BackupLevel::from_str`] for an unrecognized level.
#[derive(Debug, thiserror::Error)]
#[error("unknown backup level {0:?}, expected one of full|inc|diff|copy")]
pub struct ParseLevelError(String);

impl FromStr for BackupLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "inc" => Ok(Self::Inc),
            "diff" => Ok(Self::Diff),
            "copy" => Ok(Self::Copy),
            other => Err(ParseLevelError(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_does_not_clear_its_bitmap() {
        assert!(!BackupLevel::Diff.clears_bitmap_on_success());
        assert!(BackupLevel::Inc.clears_bitmap_on_success());
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        for level in [BackupLevel::Full, BackupLevel::Inc, BackupLevel::Diff, BackupLevel::Copy] {
            let parsed: BackupLevel = level.to_string().parse().unwrap();
            assert_eq!(parsed, level);
        }
    }

    #[test]
    fn rejects_unknown_level() {
        assert!("bogus".parse::<BackupLevel>().is_err());
    }
}
