// dbbackup/src/backup/retention.rs
use anyhow::{Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use super::archive::{path_size, remove_path};

/// A backup artifact found on disk.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl ArchiveEntry {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta
                .modified()
                .with_context(|| format!("No modification time for {}", path.display()))?,
            size: path_size(path)?,
        })
    }
}

/// Result of sweeping one unit (or one batch bucket).
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub scope: String,
    pub retained: Vec<ArchiveEntry>,
    pub deleted: Vec<ArchiveEntry>,
    /// Artifacts that should have been deleted but could not be.
    pub errors: Vec<(PathBuf, String)>,
}

impl SweepOutcome {
    pub fn retained_size(&self) -> u64 {
        self.retained.iter().map(|e| e.size).sum()
    }
}

/// Newest first; equal timestamps fall back to path order.
pub fn newest_first(a: &ArchiveEntry, b: &ArchiveEntry) -> Ordering {
    b.modified
        .cmp(&a.modified)
        .then_with(|| a.path.cmp(&b.path))
}

/// Lists entries of `dir` whose name matches `matcher`, newest first.
/// A missing directory simply has no artifacts.
pub fn discover(dir: &Path, matcher: &Regex) -> Result<Vec<ArchiveEntry>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut entries = Vec::new();
    for dir_entry in read_dir {
        let dir_entry = dir_entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let name = dir_entry.file_name();
        if !matcher.is_match(&name.to_string_lossy()) {
            continue;
        }
        match ArchiveEntry::from_path(&dir_entry.path()) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping unreadable artifact {}: {:#}", dir_entry.path().display(), e),
        }
    }
    entries.sort_by(newest_first);
    Ok(entries)
}

/// Keeps the `keep` newest matching artifacts in `dir` and deletes the rest.
///
/// `keep == 0` disables the sweep. Deletion failures are recorded, not returned.
pub fn sweep(dir: &Path, matcher: &Regex, keep: usize, scope: &str) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome {
        scope: scope.to_string(),
        ..Default::default()
    };
    let mut entries = discover(dir, matcher)?;
    if keep == 0 {
        outcome.retained = entries;
        return Ok(outcome);
    }

    let expired = if entries.len() > keep { entries.split_off(keep) } else { Vec::new() };
    outcome.retained = entries;

    for entry in expired {
        match remove_path(&entry.path) {
            Ok(()) => {
                info!("Deleted old backup {}", entry.path.display());
                outcome.deleted.push(entry);
            }
            Err(e) => {
                warn!("Failed to delete old backup {}: {}", entry.path.display(), e);
                outcome.errors.push((entry.path, e.to_string()));
            }
        }
    }
    Ok(outcome)
}
