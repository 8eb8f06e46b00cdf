// dbbackup/src/restore/logic.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::io::{Write, stdin, stdout};
use std::path::{Path, PathBuf};
use tracing::info;

use super::catalog::{Artifact, list_artifacts};
use crate::backends::{self, DumpBackend, find_executable};
use crate::backup::archive::{ArchiveFormat, copy_path, extract_archive};
use crate::backup::naming::NamingPolicy;
use crate::backup::report::format_size;
use crate::config::{AppConfig, BackupConfig, is_valid_unit_name, load_backup_config_from_json};

/// What to restore, from the command line.
#[derive(Debug, Clone, Default)]
pub struct RestoreArgs {
    /// Database to restore; narrows the listing and picks one database out of a batch.
    pub unit: Option<String>,
    /// 1-based position in the newest-first listing.
    pub index: Option<usize>,
    /// Database name to restore into, overriding the configured mapping.
    pub target: Option<String>,
    pub list_only: bool,
}

/// Public entry point for the restore process.
pub async fn run_restore_flow(app_config: &AppConfig, args: &RestoreArgs, interactive: bool) -> Result<()> {
    let config = load_backup_config_from_json(&app_config.raw_json_config)
        .context("Failed to load restore configuration from JSON")?;
    let backend = backends::from_config(config.backend, &config.connection)?;
    restore_with(&config, backend.as_ref(), args, interactive).await
}

pub(crate) async fn restore_with(
    config: &BackupConfig,
    backend: &dyn DumpBackend,
    args: &RestoreArgs,
    interactive: bool,
) -> Result<()> {
    let naming = NamingPolicy::new(&config.destination_root, &config.hostname, config.unique_id);
    let host_dir = naming.host_dir();
    let artifacts = list_artifacts(&host_dir, naming.artifact_depth(), config.strategy, args.unit.as_deref())?;
    if artifacts.is_empty() {
        anyhow::bail!("No backups found under {}", host_dir.display());
    }

    print_listing(&artifacts);
    if args.list_only {
        return Ok(());
    }

    let index = match args.index {
        Some(index) => index,
        None if interactive => prompt_index(artifacts.len())?,
        None => anyhow::bail!("Select a backup with --index when not running interactively"),
    };
    let artifact = index
        .checked_sub(1)
        .and_then(|i| artifacts.get(i))
        .with_context(|| format!("Invalid selection {}, expected 1 to {}", index, artifacts.len()))?;

    for tool in backend.required_tools() {
        find_executable(tool)?;
    }
    if let Some(tool) = ArchiveFormat::from_path(&artifact.entry.path).and_then(|f| f.required_tool()) {
        find_executable(tool)?;
    }
    backend
        .check_connectivity()
        .await
        .with_context(|| format!("Cannot reach {} server", backend.name()))?;

    fs::create_dir_all(&config.temp_root)
        .with_context(|| format!("Failed to create temporary directory {}", config.temp_root.display()))?;
    let staging = tempfile::Builder::new()
        .prefix("restore-")
        .tempdir_in(&config.temp_root)
        .context("Failed to create staging directory")?;

    let staged = stage_artifact(artifact, staging.path())?;
    let (source_unit, dump_path) = locate_dump(&staged, artifact.unit.as_deref(), args.unit.as_deref())?;

    let target = args
        .target
        .clone()
        .or_else(|| config.restore_mapping.get(&source_unit).cloned())
        .unwrap_or_else(|| source_unit.clone());
    if !is_valid_unit_name(&target) {
        anyhow::bail!("Invalid target database name '{}'", target);
    }

    info!(
        "Restoring {} from {} into {}",
        source_unit,
        artifact.entry.path.display(),
        target
    );
    backend
        .restore(&source_unit, &dump_path, &target)
        .await
        .with_context(|| format!("Failed to restore {} into {}", source_unit, target))?;

    println!("✅ Restored {} into {}", source_unit, target);
    Ok(())
}

fn print_listing(artifacts: &[Artifact]) {
    println!("Available backups (newest first):");
    for (i, artifact) in artifacts.iter().enumerate() {
        let modified: DateTime<Local> = artifact.entry.modified.into();
        println!(
            "{:>4}. {}  {:>10}  {}",
            i + 1,
            modified.format("%Y-%m-%d %H:%M:%S"),
            format_size(artifact.entry.size),
            artifact.entry.path.display()
        );
    }
}

/// Prompts for a 1-based backup number.
fn prompt_index(count: usize) -> Result<usize> {
    print!("Select a backup to restore [1-{}]: ", count);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    input
        .trim()
        .parse()
        .with_context(|| format!("Invalid selection '{}'", input.trim()))
}

/// Unpacks or copies the artifact into `staging/units`, which afterwards holds one
/// `<database>/` directory per database in the backup.
fn stage_artifact(artifact: &Artifact, staging: &Path) -> Result<PathBuf> {
    let root = staging.join("units");
    let source = &artifact.entry.path;

    if ArchiveFormat::from_path(source).is_some() {
        info!("Extracting {}", source.display());
        extract_archive(source, &root)?;
        return Ok(root);
    }

    match &artifact.unit {
        Some(unit) => {
            let unit_dir = root.join(unit);
            fs::create_dir_all(&unit_dir)
                .with_context(|| format!("Failed to create staging directory {}", unit_dir.display()))?;
            let name = source
                .file_name()
                .with_context(|| format!("Backup path has no file name: {}", source.display()))?;
            copy_path(source, &unit_dir.join(name))?;
        }
        None => copy_path(source, &root)?,
    }
    Ok(root)
}

/// Picks the database to restore from the staged tree and the dump it should be
/// restored from: the single file or directory it contains, or the directory itself.
fn locate_dump(staged: &Path, artifact_unit: Option<&str>, requested: Option<&str>) -> Result<(String, PathBuf)> {
    let mut units: Vec<String> = fs::read_dir(staged)
        .with_context(|| format!("Failed to list staged backup {}", staged.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    units.sort();

    let unit = match (artifact_unit, requested) {
        (Some(unit), _) | (None, Some(unit)) => unit.to_string(),
        (None, None) => match units.as_slice() {
            [only] => only.clone(),
            _ => anyhow::bail!(
                "Backup contains several databases ({}); choose one with --unit",
                units.join(", ")
            ),
        },
    };
    if !units.contains(&unit) {
        anyhow::bail!("Database '{}' is not part of this backup ({})", unit, units.join(", "));
    }

    let unit_dir = staged.join(&unit);
    let contents: Vec<PathBuf> = fs::read_dir(&unit_dir)
        .with_context(|| format!("Failed to list {}", unit_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    match contents.as_slice() {
        [] => anyhow::bail!("Staged backup of {} is empty", unit),
        [single] => Ok((unit, single.clone())),
        _ => Ok((unit, unit_dir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::backends::fake::FakeBackend;
    use crate::backup::context::RunContext;
    use crate::backup::logic::perform_backup;
    use crate::backup::naming::Strategy;
    use crate::config::ConnectionConfig;
    use std::collections::HashMap;

    fn config(root: &Path, strategy: Strategy, compression: Option<ArchiveFormat>, unique_id: bool) -> BackupConfig {
        BackupConfig {
            backend: BackendKind::MySql,
            connection: ConnectionConfig::default(),
            destination_root: root.join("backups"),
            temp_root: root.join("tmp"),
            hostname: "db01".to_string(),
            databases_to_backup: None,
            restore_mapping: HashMap::new(),
            exclude: Vec::new(),
            compression,
            strategy,
            unique_id,
            retention_count: 0,
            min_free_bytes: 0,
            notification: None,
        }
    }

    async fn back_up(config: &BackupConfig, backend: &FakeBackend) {
        let ctx = RunContext::for_config(config, backend.name(), Local::now());
        let ctx = perform_backup(config, backend, ctx).await;
        assert!(ctx.failed().next().is_none());
    }

    fn restores(backend: &FakeBackend) -> Vec<String> {
        backend.calls().into_iter().filter(|c| c.starts_with("restore")).collect()
    }

    fn args(unit: Option<&str>, index: usize) -> RestoreArgs {
        RestoreArgs {
            unit: unit.map(String::from),
            index: Some(index),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_restore_unit_archive() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), Strategy::PerUnit, Some(ArchiveFormat::Gzip), true);
        let backend = FakeBackend::new(&["shop", "crm"]);
        back_up(&config, &backend).await;

        restore_with(&config, &backend, &args(Some("shop"), 1), false).await?;

        assert_eq!(restores(&backend), vec!["restore shop -> shop"]);
        // Staging is cleaned up, run directories never survive.
        assert!(fs::read_dir(&config.temp_root)?.next().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_raw_unit_into_override_target() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), Strategy::PerUnit, None, false);
        let backend = FakeBackend::new(&["shop"]);
        back_up(&config, &backend).await;

        let mut restore_args = args(None, 1);
        restore_args.target = Some("shop_staging".to_string());
        restore_with(&config, &backend, &restore_args, false).await?;

        assert_eq!(restores(&backend), vec!["restore shop -> shop_staging"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_from_batch_uses_mapping() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = config(root.path(), Strategy::PerBatch, Some(ArchiveFormat::Gzip), false);
        config.restore_mapping.insert("beta".to_string(), "beta_copy".to_string());
        let backend = FakeBackend::new(&["alpha", "beta"]);
        back_up(&config, &backend).await;

        restore_with(&config, &backend, &args(Some("beta"), 1), false).await?;
        assert_eq!(restores(&backend), vec!["restore beta -> beta_copy"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_with_several_databases_needs_unit() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), Strategy::PerBatch, None, true);
        let backend = FakeBackend::new(&["alpha", "beta"]);
        back_up(&config, &backend).await;

        let err = restore_with(&config, &backend, &args(None, 1), false).await.unwrap_err();
        assert!(err.to_string().contains("--unit"));
        assert!(restores(&backend).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_only_and_bad_selection() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), Strategy::PerUnit, Some(ArchiveFormat::Zstd), true);
        let backend = FakeBackend::new(&["shop"]);
        back_up(&config, &backend).await;

        let list = RestoreArgs {
            list_only: true,
            ..Default::default()
        };
        restore_with(&config, &backend, &list, false).await?;
        assert!(restore_with(&config, &backend, &args(None, 0), false).await.is_err());
        assert!(restore_with(&config, &backend, &args(None, 2), false).await.is_err());
        assert!(restore_with(&config, &backend, &RestoreArgs::default(), false).await.is_err());
        assert!(restores(&backend).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_restore() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), Strategy::PerUnit, None, false);
        let err = restore_with(&config, &FakeBackend::new(&[]), &args(None, 1), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No backups found"));
        Ok(())
    }
}
