// dbbackup/src/backup/compress.rs
use chrono::NaiveDate;
use std::path::Path;
use tracing::{error, info, warn};

use super::archive::{ArchiveFormat, create_archive, move_path, remove_path};
use super::context::{BackupUnit, BatchArtifact, Outcome, RunContext};
use super::naming::NamingPolicy;

/// Extension a raw dump keeps when it becomes the artifact itself.
fn raw_extension(output: &Path) -> String {
    if output.is_dir() {
        return String::new();
    }
    output
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Turns one successful dump into its durable artifact right after it was taken.
///
/// The archive contains `<unit>/<dump output>`. If archiving fails the dump is moved
/// to its uncompressed name instead of being thrown away.
pub fn finalize_unit(
    mut unit: BackupUnit,
    format: Option<ArchiveFormat>,
    naming: &mut NamingPolicy,
    date: NaiveDate,
    run_dir: &Path,
) -> BackupUnit {
    if unit.outcome != Outcome::Success {
        return unit;
    }
    let Some(output) = unit.dump_path.clone() else {
        return unit;
    };
    let unit_dir = run_dir.join(&unit.name);

    if let Some(format) = format {
        let dest = naming.unit_artifact_path(&unit.name, date, format.extension());
        info!("Compressing {} to {}", unit.name, dest.display());
        match create_archive(format, run_dir, &[unit.name.clone()], &dest) {
            Ok(size) => {
                if let Err(e) = remove_path(&unit_dir) {
                    warn!("Failed to remove temporary dump {}: {}", unit_dir.display(), e);
                }
                unit.mark_archived(dest, Some(size));
            }
            Err(e) => {
                let detail = format!("{:#}", e);
                error!("Compression of {} failed: {}", unit.name, detail);
                let raw_dest = naming.unit_artifact_path(&unit.name, date, &raw_extension(&output));
                match move_path(&output, &raw_dest) {
                    Ok(()) => {
                        warn!("Kept uncompressed dump of {} at {}", unit.name, raw_dest.display());
                        if let Err(e) = remove_path(&unit_dir) {
                            warn!("Failed to remove temporary dump {}: {}", unit_dir.display(), e);
                        }
                        unit.mark_compression_failed(detail, Some(raw_dest));
                    }
                    Err(move_err) => {
                        error!("Failed to store uncompressed dump of {}: {:#}", unit.name, move_err);
                        unit.mark_compression_failed(
                            format!("{}; storing the uncompressed dump also failed: {:#}", detail, move_err),
                            Some(output),
                        );
                    }
                }
            }
        }
        return unit;
    }

    let dest = naming.unit_artifact_path(&unit.name, date, &raw_extension(&output));
    match move_path(&output, &dest) {
        Ok(()) => {
            info!("Stored uncompressed dump of {} at {}", unit.name, dest.display());
            if let Err(e) = remove_path(&unit_dir) {
                warn!("Failed to remove temporary dump {}: {}", unit_dir.display(), e);
            }
            unit.mark_archived(dest, None);
        }
        Err(e) => {
            let detail = format!("{:#}", e);
            error!("Failed to store dump of {}: {}", unit.name, detail);
            unit.mark_compression_failed(detail, Some(output));
        }
    }
    unit
}

/// Combines every successful dump of the run into the single batch artifact.
/// Nothing is produced when no database was dumped.
pub fn finalize_batch(mut ctx: RunContext, naming: &mut NamingPolicy, run_dir: &Path) -> RunContext {
    let succeeded: Vec<String> = ctx
        .units
        .iter()
        .filter(|u| u.outcome == Outcome::Success && u.dump_path.is_some())
        .map(|u| u.name.clone())
        .collect();
    if succeeded.is_empty() {
        warn!("No database was dumped successfully, skipping batch archive");
        return ctx;
    }
    let pre_compress_size: u64 = ctx
        .units
        .iter()
        .filter(|u| succeeded.contains(&u.name))
        .filter_map(|u| u.pre_compress_size)
        .sum();
    let date = ctx.date();

    if let Some(format) = ctx.compression {
        let dest = naming.batch_artifact_path(date, format.extension());
        info!("Compressing {} databases to {}", succeeded.len(), dest.display());
        match create_archive(format, run_dir, &succeeded, &dest) {
            Ok(size) => {
                for unit in ctx.units.iter_mut().filter(|u| succeeded.contains(&u.name)) {
                    let unit_dir = run_dir.join(&unit.name);
                    if let Err(e) = remove_path(&unit_dir) {
                        warn!("Failed to remove temporary dump {}: {}", unit_dir.display(), e);
                    }
                    unit.mark_archived(dest.clone(), None);
                }
                ctx.batch = Some(BatchArtifact {
                    path: dest,
                    pre_compress_size,
                    post_compress_size: Some(size),
                });
                return ctx;
            }
            Err(e) => {
                let detail = format!("{:#}", e);
                error!("Compression of batch archive failed: {}", detail);
                return store_raw_batch(ctx, &succeeded, naming, run_dir, pre_compress_size, Some(detail));
            }
        }
    }

    store_raw_batch(ctx, &succeeded, naming, run_dir, pre_compress_size, None)
}

/// Moves the run directory, which by now only holds successful dumps, to the batch name.
fn store_raw_batch(
    mut ctx: RunContext,
    succeeded: &[String],
    naming: &mut NamingPolicy,
    run_dir: &Path,
    pre_compress_size: u64,
    compression_error: Option<String>,
) -> RunContext {
    let dest = naming.batch_artifact_path(ctx.date(), "");
    let moved = move_path(run_dir, &dest);
    let stored_at = if moved.is_ok() { dest.clone() } else { run_dir.to_path_buf() };

    for unit in ctx.units.iter_mut().filter(|u| succeeded.contains(&u.name)) {
        let unit_path = stored_at.join(&unit.name);
        match (&moved, &compression_error) {
            (Ok(()), None) => unit.mark_archived(unit_path, None),
            (Ok(()), Some(detail)) => unit.mark_compression_failed(detail.clone(), Some(unit_path)),
            (Err(move_err), detail) => {
                let detail = match detail {
                    Some(d) => format!("{}; storing the uncompressed dumps also failed: {:#}", d, move_err),
                    None => format!("Failed to store batch at {}: {:#}", dest.display(), move_err),
                };
                unit.mark_compression_failed(detail, Some(unit_path));
            }
        }
    }

    match moved {
        Ok(()) => {
            info!("Stored uncompressed batch at {}", dest.display());
            ctx.batch = Some(BatchArtifact {
                path: dest,
                pre_compress_size,
                post_compress_size: None,
            });
        }
        Err(e) => error!("Failed to store batch at {}: {:#}", dest.display(), e),
    }
    ctx
}
