// dbbackup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archive::path_size;
use super::context::BackupUnit;
use crate::backends::DumpBackend;
use crate::config::{BackupConfig, is_valid_unit_name};
use crate::errors::BackupError;

/// Resolves the databases to back up: the configured list as given, or everything
/// the server lists minus the exclusion list and the backend's system databases.
pub async fn resolve_units(config: &BackupConfig, backend: &dyn DumpBackend) -> Result<Vec<String>, BackupError> {
    let names = match &config.databases_to_backup {
        Some(dbs) => {
            let mut unique: Vec<String> = Vec::with_capacity(dbs.len());
            for db in dbs {
                if !unique.contains(db) {
                    unique.push(db.clone());
                }
            }
            unique
        }
        None => {
            info!("No specific databases listed in config, fetching all databases from the server");
            backend
                .list_units()
                .await
                .map_err(|e| BackupError::Unreachable {
                    backend: backend.name().to_string(),
                    reason: format!("{:#}", e),
                })?
                .into_iter()
                .filter(|db| !config.exclude.contains(db))
                .filter(|db| !backend.system_units().contains(&db.as_str()))
                .filter(|db| {
                    // Names become paths under the run directory.
                    let valid = is_valid_unit_name(db);
                    if !valid {
                        warn!("Skipping database with unsupported name {:?}", db);
                    }
                    valid
                })
                .collect()
        }
    };

    if names.is_empty() {
        return Err(BackupError::NoUnits);
    }
    info!("Databases to be backed up: {:?}", names);
    Ok(names)
}

/// Creates the temporary directory of this run, first clearing the run directories
/// that earlier (cancelled or crashed) runs left under `temp_root`. Anything else
/// in `temp_root` is left alone.
pub fn prepare_run_dir(temp_root: &Path, run_id: Uuid) -> Result<PathBuf> {
    if temp_root.is_dir() {
        for entry in fs::read_dir(temp_root)
            .with_context(|| format!("Failed to list temporary directory {}", temp_root.display()))?
        {
            let entry = entry?;
            let is_run_dir = Uuid::parse_str(&entry.file_name().to_string_lossy()).is_ok();
            if !is_run_dir {
                continue;
            }
            let path = entry.path();
            warn!("Removing leftover temporary data {}", path.display());
            if let Err(e) = super::archive::remove_path(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    let run_dir = temp_root.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create temporary backup directory {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Dumps one database into `<run_dir>/<unit>/`.
///
/// A failure is recorded on the unit and the partial output removed; it never
/// propagates, so the next database is still attempted.
pub async fn dump_unit(backend: &dyn DumpBackend, mut unit: BackupUnit, run_dir: &Path) -> BackupUnit {
    let unit_dir = run_dir.join(&unit.name);
    info!("Backing up database: {}", unit.name);

    match dump_into(backend, &unit.name, &unit_dir).await {
        Ok((output, size)) => {
            info!("Dumped {} ({} bytes) to {}", unit.name, size, output.display());
            unit.mark_dumped(output, size);
        }
        Err(e) => {
            let detail = format!("{:#}", e);
            error!("Backup of {} failed: {}", unit.name, detail);
            if unit_dir.exists() {
                if let Err(rm) = fs::remove_dir_all(&unit_dir) {
                    warn!("Failed to remove partial dump {}: {}", unit_dir.display(), rm);
                }
            }
            unit.mark_failed(detail);
        }
    }
    unit
}

async fn dump_into(backend: &dyn DumpBackend, name: &str, unit_dir: &Path) -> Result<(PathBuf, u64)> {
    fs::create_dir_all(unit_dir)
        .with_context(|| format!("Failed to create dump directory {}", unit_dir.display()))?;
    let output = backend.dump(name, unit_dir).await?;
    let size = path_size(&output)
        .with_context(|| format!("Dump of {} reported {} but it cannot be read", name, output.display()))?;
    Ok((output, size))
}
