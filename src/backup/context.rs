// dbbackup/src/backup/context.rs
use chrono::{DateTime, Local, NaiveDate};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::archive::ArchiveFormat;
use super::naming::Strategy;
use super::retention::SweepOutcome;
use crate::config::BackupConfig;
use crate::errors::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Failed,
}

/// One database taking part in a run.
#[derive(Debug, Clone)]
pub struct BackupUnit {
    pub name: String,
    pub outcome: Outcome,
    /// Verbatim error text; set iff `outcome` is `Failed`.
    pub error_detail: Option<String>,
    pub pre_compress_size: Option<u64>,
    pub post_compress_size: Option<u64>,
    pub archive_path: Option<PathBuf>,
    /// The dump succeeded but could not be archived; the raw output was kept instead.
    pub compression_error: Option<String>,
    /// Temporary dump output, only meaningful between the dump and compress stages.
    pub(crate) dump_path: Option<PathBuf>,
}

impl BackupUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::Pending,
            error_detail: None,
            pre_compress_size: None,
            post_compress_size: None,
            archive_path: None,
            compression_error: None,
            dump_path: None,
        }
    }

    pub fn mark_dumped(&mut self, output: PathBuf, size: u64) {
        self.outcome = Outcome::Success;
        self.pre_compress_size = Some(size);
        self.dump_path = Some(output);
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        self.outcome = Outcome::Failed;
        self.error_detail = Some(detail.into());
        self.dump_path = None;
    }

    /// `size` is `None` when the artifact is the uncompressed dump or a shared batch archive.
    pub fn mark_archived(&mut self, path: PathBuf, size: Option<u64>) {
        self.archive_path = Some(path);
        self.post_compress_size = size;
        self.dump_path = None;
    }

    pub fn mark_compression_failed(&mut self, detail: impl Into<String>, kept_at: Option<PathBuf>) {
        self.compression_error = Some(detail.into());
        self.archive_path = kept_at;
        self.dump_path = None;
    }

    /// Counts towards a FAILED run.
    pub fn has_failed(&self) -> bool {
        self.outcome == Outcome::Failed || self.compression_error.is_some()
    }
}

/// Pipeline states in the order a run moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    CheckingDependencies,
    CheckingConnectivity,
    Dumping,
    Compressing,
    Sweeping,
    Reporting,
    Done,
    FailedFast,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::CheckingDependencies => "checking-dependencies",
            Stage::CheckingConnectivity => "checking-connectivity",
            Stage::Dumping => "dumping",
            Stage::Compressing => "compressing",
            Stage::Sweeping => "sweeping",
            Stage::Reporting => "reporting",
            Stage::Done => "done",
            Stage::FailedFast => "failed-fast",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The single artifact of a per-batch run.
#[derive(Debug, Clone)]
pub struct BatchArtifact {
    pub path: PathBuf,
    pub pre_compress_size: u64,
    pub post_compress_size: Option<u64>,
}

/// State of one invocation, handed from stage to stage by value.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub timestamp: DateTime<Local>,
    pub host: String,
    pub backend: String,
    pub strategy: Strategy,
    pub unique_id: bool,
    pub retention_count: usize,
    pub compression: Option<ArchiveFormat>,
    /// Processing order is insertion order.
    pub units: Vec<BackupUnit>,
    pub batch: Option<BatchArtifact>,
    pub sweeps: Vec<SweepOutcome>,
    pub stage: Stage,
}

impl RunContext {
    pub fn for_config(config: &BackupConfig, backend: &str, timestamp: DateTime<Local>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp,
            host: config.hostname.clone(),
            backend: backend.to_string(),
            strategy: config.strategy,
            unique_id: config.unique_id,
            retention_count: config.retention_count,
            compression: config.compression,
            units: Vec::new(),
            batch: None,
            sweeps: Vec::new(),
            stage: Stage::Validating,
        }
    }

    /// Context for a run whose configuration never validated.
    pub fn unconfigured(host: &str, backend: &str, timestamp: DateTime<Local>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp,
            host: host.to_string(),
            backend: backend.to_string(),
            strategy: Strategy::PerUnit,
            unique_id: false,
            retention_count: 0,
            compression: None,
            units: Vec::new(),
            batch: None,
            sweeps: Vec::new(),
            stage: Stage::Validating,
        }
    }

    /// Replaces the unit list with one synthetic failed unit naming the failed check.
    pub fn fail_fast(mut self, err: &BackupError) -> Self {
        let mut unit = BackupUnit::new(err.check_name());
        unit.mark_failed(err.to_string());
        self.units = vec![unit];
        self.batch = None;
        self.stage = Stage::FailedFast;
        self
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Sweeping only makes sense when names are unique; flat names already keep one per day.
    pub fn retention_active(&self) -> bool {
        self.unique_id && self.retention_count > 0
    }

    pub fn status(&self) -> RunStatus {
        if self.units.iter().any(BackupUnit::has_failed) {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BackupUnit> {
        self.units.iter().filter(|u| !u.has_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BackupUnit> {
        self.units.iter().filter(|u| u.has_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        RunContext::unconfigured("db01", "mysql", Local::now())
    }

    #[test]
    fn test_status_reflects_failed_units() {
        let mut ctx = context();
        let mut ok = BackupUnit::new("shop");
        ok.mark_dumped(PathBuf::from("/tmp/shop.sql"), 10);
        ctx.units.push(ok);
        assert_eq!(ctx.status(), RunStatus::Success);

        let mut bad = BackupUnit::new("gone");
        bad.mark_failed("Unknown database 'gone'");
        ctx.units.push(bad);
        assert_eq!(ctx.status(), RunStatus::Failed);
        assert_eq!(ctx.failed().count(), 1);
        assert_eq!(ctx.succeeded().count(), 1);
    }

    #[test]
    fn test_compression_failure_fails_run_but_keeps_dump_outcome() {
        let mut ctx = context();
        let mut unit = BackupUnit::new("shop");
        unit.mark_dumped(PathBuf::from("/tmp/shop.sql"), 10);
        unit.mark_compression_failed("disk full", Some(PathBuf::from("/b/shop-2024-03-07.sql")));
        ctx.units.push(unit);

        assert_eq!(ctx.units[0].outcome, Outcome::Success);
        assert_eq!(ctx.status(), RunStatus::Failed);
    }

    #[test]
    fn test_fail_fast_leaves_single_synthetic_unit() {
        let mut ctx = context();
        ctx.units.push(BackupUnit::new("shop"));
        let ctx = ctx.fail_fast(&BackupError::MissingTool { tool: "mysqldump".into() });

        assert_eq!(ctx.stage, Stage::FailedFast);
        assert_eq!(ctx.units.len(), 1);
        assert_eq!(ctx.units[0].name, "dependencies");
        assert_eq!(ctx.units[0].outcome, Outcome::Failed);
        assert!(ctx.units[0].error_detail.as_deref().unwrap().contains("mysqldump"));
        assert_eq!(ctx.status(), RunStatus::Failed);
    }

    #[test]
    fn test_retention_ignored_without_unique_ids() {
        let mut ctx = context();
        ctx.retention_count = 5;
        assert!(!ctx.retention_active());
        ctx.unique_id = true;
        assert!(ctx.retention_active());
        ctx.retention_count = 0;
        assert!(!ctx.retention_active());
    }
}
