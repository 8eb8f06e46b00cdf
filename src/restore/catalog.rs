// dbbackup/src/restore/catalog.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::backup::naming::{Strategy, is_batch_artifact_name, unit_from_artifact_name};
use crate::backup::retention::{ArchiveEntry, newest_first};

/// A backup that can be restored.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub entry: ArchiveEntry,
    /// The database a per-unit artifact belongs to; `None` for batch artifacts.
    pub unit: Option<String>,
}

/// Finds every artifact `depth` levels below `host_dir`, newest first.
///
/// Per-unit artifacts can be narrowed to one database. Batch artifacts are not
/// filtered, the database is picked after staging.
pub fn list_artifacts(
    host_dir: &Path,
    depth: usize,
    strategy: Strategy,
    unit_filter: Option<&str>,
) -> Result<Vec<Artifact>> {
    if !host_dir.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(host_dir).min_depth(depth).max_depth(depth) {
        let entry = entry.with_context(|| format!("Failed to walk backup directory {}", host_dir.display()))?;
        let name = entry.file_name().to_string_lossy();
        let unit = match strategy {
            Strategy::PerUnit => match unit_from_artifact_name(&name) {
                Some(unit) if unit_filter.is_none_or(|wanted| wanted == unit) => Some(unit),
                _ => continue,
            },
            Strategy::PerBatch if is_batch_artifact_name(&name) => None,
            Strategy::PerBatch => continue,
        };
        match ArchiveEntry::from_path(entry.path()) {
            Ok(entry) => found.push(Artifact { entry, unit }),
            Err(e) => warn!("Skipping unreadable backup {}: {:#}", entry.path().display(), e),
        }
    }

    found.sort_by(|a, b| newest_first(&a.entry, &b.entry));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    fn artifact(dir: &Path, name: &str, age_secs: u64) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        fs::write(&path, name.as_bytes())?;
        File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now() - Duration::from_secs(age_secs))?;
        Ok(path)
    }

    fn names(artifacts: &[Artifact]) -> Vec<String> {
        artifacts
            .iter()
            .map(|a| a.entry.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_unit_artifacts_newest_first() -> anyhow::Result<()> {
        let host = tempfile::tempdir()?;
        let year = host.path().join("2024");
        artifact(&year, "shop-2024-03-05_aaaaaa.tar.gz", 300)?;
        artifact(&year, "shop-2024-03-07_bbbbbb.tar.gz", 100)?;
        artifact(&year, "crm-2024-03-06_cccccc.tar.gz", 200)?;
        artifact(&year, "notes.txt", 10)?;

        let all = list_artifacts(host.path(), 2, Strategy::PerUnit, None)?;
        assert_eq!(
            names(&all),
            vec![
                "shop-2024-03-07_bbbbbb.tar.gz",
                "crm-2024-03-06_cccccc.tar.gz",
                "shop-2024-03-05_aaaaaa.tar.gz"
            ]
        );
        assert_eq!(all[1].unit.as_deref(), Some("crm"));

        let shop = list_artifacts(host.path(), 2, Strategy::PerUnit, Some("shop"))?;
        assert_eq!(shop.len(), 2);
        assert!(shop.iter().all(|a| a.unit.as_deref() == Some("shop")));
        Ok(())
    }

    #[test]
    fn test_batch_artifacts_in_flat_layout() -> anyhow::Result<()> {
        let host = tempfile::tempdir()?;
        artifact(&host.path().join("2024/03/06"), "06.tar.xz", 200)?;
        artifact(&host.path().join("2024/03/07"), "07.tar.xz", 100)?;
        artifact(&host.path().join("2024/03/07"), "shop-2024-03-07.tar.xz", 50)?;

        let batches = list_artifacts(host.path(), 4, Strategy::PerBatch, None)?;
        assert_eq!(names(&batches), vec!["07.tar.xz", "06.tar.xz"]);
        assert!(batches.iter().all(|a| a.unit.is_none()));
        Ok(())
    }

    #[test]
    fn test_missing_host_dir_has_no_backups() -> anyhow::Result<()> {
        let host = tempfile::tempdir()?;
        assert!(list_artifacts(&host.path().join("absent"), 2, Strategy::PerUnit, None)?.is_empty());
        Ok(())
    }
}
