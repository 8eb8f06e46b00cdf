// dbbackup/src/backup/logic.rs
use chrono::Local;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::compress::{finalize_batch, finalize_unit};
use super::context::{BackupUnit, Outcome, RunContext, RunStatus, Stage};
use super::db_dump::{dump_unit, prepare_run_dir, resolve_units};
use super::naming::{NamingPolicy, Strategy, batch_matcher, unit_matcher};
use super::report::{Report, build_report};
use super::retention;
use crate::backends::{self, DumpBackend, find_executable};
use crate::config::{
    BackupConfig, NotificationConfig, RawJsonConfig, load_backup_config_from_json, notification_from_raw,
    system_hostname,
};
use crate::errors::BackupError;
use crate::utils::disk::ensure_free_space;
use crate::utils::notify::{Notifier, SendmailNotifier};

/// Runs one complete backup from the raw configuration and returns its report.
///
/// Never fails: every problem ends up in the report, which is also mailed when a
/// recipient is configured.
pub async fn run_backup_flow(raw_config: &RawJsonConfig) -> Report {
    let timestamp = Local::now();

    let config = match load_backup_config_from_json(raw_config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            let host = raw_config
                .hostname
                .clone()
                .unwrap_or_else(system_hostname);
            let backend = raw_config.backend.as_deref().unwrap_or("unknown");
            let ctx = RunContext::unconfigured(&host, backend, timestamp).fail_fast(&e);
            let report = finish(ctx);
            if let Some(notification) = notification_from_raw(raw_config, &host) {
                deliver(&sendmail_for(&notification), &notification, &report).await;
            }
            return report;
        }
    };

    let ctx = RunContext::for_config(&config, &config.backend.to_string(), timestamp);
    let span = info_span!("backup", run_id = %ctx.run_id, backend = %config.backend);
    async move {
        let notifier = config.notification.as_ref().map(|n| (n, sendmail_for(n)));

        let ctx = match backends::from_config(config.backend, &config.connection) {
            Ok(backend) => {
                if let Some((notification, sendmail)) = &notifier {
                    if notification.notify_on_start {
                        notify_start(sendmail, notification, &ctx).await;
                    }
                }
                perform_backup(&config, backend.as_ref(), ctx).await
            }
            Err(e) => {
                let err = BackupError::Config(format!("{:#}", e));
                error!("{}", err);
                ctx.fail_fast(&err)
            }
        };

        let report = finish(ctx);
        if let Some((notification, sendmail)) = &notifier {
            deliver(sendmail, notification, &report).await;
        }
        report
    }
    .instrument(span)
    .await
}

/// Drives a validated configuration through the pipeline stages.
pub async fn perform_backup(config: &BackupConfig, backend: &dyn DumpBackend, mut ctx: RunContext) -> RunContext {
    ctx.stage = Stage::CheckingDependencies;
    if let Err(e) = check_dependencies(config, backend) {
        error!("Dependency check failed: {}", e);
        return ctx.fail_fast(&e);
    }

    ctx.stage = Stage::CheckingConnectivity;
    let names = match check_connectivity(config, backend).await {
        Ok(names) => names,
        Err(e) => {
            error!("Connectivity check failed: {}", e);
            return ctx.fail_fast(&e);
        }
    };
    ctx.units = names.into_iter().map(BackupUnit::new).collect();

    let run_dir = match prepare_run_dir(&config.temp_root, ctx.run_id) {
        Ok(dir) => dir,
        Err(e) => {
            let err = BackupError::Io(io::Error::other(format!("{:#}", e)));
            error!("{}", err);
            return ctx.fail_fast(&err);
        }
    };

    ctx.stage = Stage::Dumping;
    let mut naming = NamingPolicy::new(&config.destination_root, &config.hostname, config.unique_id);
    let date = ctx.date();
    let pending = std::mem::take(&mut ctx.units);
    for unit in pending {
        let unit = dump_unit(backend, unit, &run_dir).await;
        // Per-unit artifacts are finished right away so a dump never waits on later ones.
        let unit = match config.strategy {
            Strategy::PerUnit => finalize_unit(unit, config.compression, &mut naming, date, &run_dir),
            Strategy::PerBatch => unit,
        };
        ctx.units.push(unit);
    }

    ctx.stage = Stage::Compressing;
    if config.strategy == Strategy::PerBatch {
        ctx = finalize_batch(ctx, &mut naming, &run_dir);
    }

    ctx.stage = Stage::Sweeping;
    if ctx.retention_active() {
        ctx = sweep_old_artifacts(ctx, &naming);
    } else {
        debug!("Retention disabled, keeping all existing backups");
    }

    release_run_dir(&mut ctx, &run_dir);

    ctx.stage = Stage::Reporting;
    ctx
}

/// Removes the run's temporary directory. When a unit's only copy still lives in it
/// (archiving and storing both failed) the directory is renamed to `kept-<run id>`
/// instead, which the next run's temp cleanup leaves alone.
fn release_run_dir(ctx: &mut RunContext, run_dir: &Path) {
    if !run_dir.exists() {
        return;
    }
    let holds_kept_dump = ctx
        .units
        .iter()
        .filter_map(|u| u.archive_path.as_deref())
        .any(|p| p.starts_with(run_dir));
    if !holds_kept_dump {
        if let Err(e) = fs::remove_dir_all(run_dir) {
            warn!("Failed to remove temporary directory {}: {}", run_dir.display(), e);
        }
        return;
    }

    let kept_dir = run_dir.with_file_name(format!("kept-{}", ctx.run_id));
    if let Err(e) = fs::rename(run_dir, &kept_dir) {
        warn!("Uncompressed dumps remain in {}, move them out before the next run: {}", run_dir.display(), e);
        return;
    }
    warn!("Uncompressed dumps kept in {}", kept_dir.display());
    for unit in &mut ctx.units {
        let relocated = unit
            .archive_path
            .as_deref()
            .and_then(|p| p.strip_prefix(run_dir).ok())
            .map(|rel| kept_dir.join(rel));
        if relocated.is_some() {
            unit.archive_path = relocated;
        }
    }
}

fn check_dependencies(config: &BackupConfig, backend: &dyn DumpBackend) -> Result<(), BackupError> {
    let mut tools = backend.required_tools();
    if let Some(tool) = config.compression.and_then(|format| format.required_tool()) {
        tools.push(tool);
    }
    for tool in tools {
        let path = find_executable(tool)?;
        debug!("Found {} at {}", tool, path.display());
    }

    fs::create_dir_all(&config.destination_root)?;
    ensure_free_space(&config.destination_root, config.min_free_bytes)?;
    Ok(())
}

async fn check_connectivity(config: &BackupConfig, backend: &dyn DumpBackend) -> Result<Vec<String>, BackupError> {
    backend
        .check_connectivity()
        .await
        .map_err(|e| BackupError::Unreachable {
            backend: backend.name().to_string(),
            reason: format!("{:#}", e),
        })?;
    info!("Connected to {} server", backend.name());
    resolve_units(config, backend).await
}

/// Applies the retention count to every unit that produced a new artifact, or to the
/// day bucket of the batch. Failures here never fail the run.
fn sweep_old_artifacts(mut ctx: RunContext, naming: &NamingPolicy) -> RunContext {
    let date = ctx.date();
    let dir = naming.destination_dir(date);
    let scopes: Vec<(String, anyhow::Result<regex::Regex>)> = match ctx.strategy {
        Strategy::PerUnit => ctx
            .units
            .iter()
            .filter(|u| u.outcome == Outcome::Success && u.archive_path.is_some())
            .map(|u| (u.name.clone(), unit_matcher(&u.name)))
            .collect(),
        Strategy::PerBatch if ctx.batch.is_some() => {
            vec![(format!("batch {}", date.format("%d")), batch_matcher(date))]
        }
        Strategy::PerBatch => Vec::new(),
    };

    for (scope, matcher) in scopes {
        match matcher.and_then(|m| retention::sweep(&dir, &m, ctx.retention_count, &scope)) {
            Ok(outcome) => {
                info!(
                    "Retention for {}: kept {}, deleted {}",
                    scope,
                    outcome.retained.len(),
                    outcome.deleted.len()
                );
                ctx.sweeps.push(outcome);
            }
            Err(e) => warn!("Retention sweep for {} failed: {:#}", scope, e),
        }
    }
    ctx
}

fn finish(mut ctx: RunContext) -> Report {
    let report = build_report(&ctx);
    match report.status {
        RunStatus::Success => info!("{}\n{}", report.subject, report.body),
        RunStatus::Failed => error!("{}\n{}", report.subject, report.body),
    }
    ctx.stage = Stage::Done;
    debug!("Run {} reached stage {}", ctx.run_id, ctx.stage);
    report
}

fn sendmail_for(notification: &NotificationConfig) -> SendmailNotifier {
    SendmailNotifier::new(&notification.sendmail_path)
}

async fn notify_start(notifier: &dyn Notifier, notification: &NotificationConfig, ctx: &RunContext) {
    let subject = format!("[STARTED] {} backup on {} ({})", ctx.backend, ctx.host, ctx.date().format("%Y-%m-%d"));
    let body = format!(
        "Backup run {} started at {}.",
        ctx.run_id,
        ctx.timestamp.format("%Y-%m-%d %H:%M:%S %:z")
    );
    if let Err(e) = notifier
        .send(&notification.recipient, &notification.sender, &subject, &body)
        .await
    {
        warn!("Failed to send start notification: {:#}", e);
    }
}

/// Best effort: a failed delivery is logged and leaves the run status alone.
async fn deliver(notifier: &dyn Notifier, notification: &NotificationConfig, report: &Report) {
    match notifier
        .send(&notification.recipient, &notification.sender, &report.subject, &report.body)
        .await
    {
        Ok(()) => info!("Report sent to {}", notification.recipient),
        Err(e) => warn!("Failed to send report to {}: {:#}", notification.recipient, e),
    }
}
