// dbbackup/src/backup/naming.rs
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rand::{Rng, distr::Alphanumeric};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::BackupError;

const SUFFIX_LEN: usize = 6;
const SUFFIX_PATTERN: &str = r"(?:_[A-Za-z0-9]{6})?";
const EXT_PATTERN: &str = r"(?:\.[A-Za-z0-9]+)*";

static UNIT_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(.+)-\d{{4}}-\d{{2}}-\d{{2}}{SUFFIX_PATTERN}{EXT_PATTERN}$"))
        .expect("unit artifact pattern is valid")
});

static BATCH_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^\d{{2}}{SUFFIX_PATTERN}{EXT_PATTERN}$")).expect("batch artifact pattern is valid")
});

/// How dumps are grouped into artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One artifact per database.
    PerUnit,
    /// One artifact holding every database dumped in the run.
    PerBatch,
}

impl FromStr for Strategy {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_unit" | "per-unit" | "unit" | "database" => Ok(Strategy::PerUnit),
            "per_batch" | "per-batch" | "batch" | "single" => Ok(Strategy::PerBatch),
            other => Err(BackupError::Config(format!(
                "Unknown strategy '{}', expected 'per_unit' or 'per_batch'",
                other
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::PerUnit => write!(f, "per_unit"),
            Strategy::PerBatch => write!(f, "per_batch"),
        }
    }
}

/// Derives where artifacts go and what they are called.
///
/// With unique IDs the tree is `<root>/<host>/<YYYY>` and every name carries a random
/// suffix, so any number of runs per day coexist. Without them the tree is
/// `<root>/<host>/<YYYY>/<MM>/<DD>` and names are fixed, so a later run on the same
/// day lands on the same path as the earlier one.
#[derive(Debug)]
pub struct NamingPolicy {
    root: PathBuf,
    host: String,
    unique_id: bool,
    issued: HashSet<String>,
}

impl NamingPolicy {
    pub fn new(root: impl Into<PathBuf>, host: impl Into<String>, unique_id: bool) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            unique_id,
            issued: HashSet::new(),
        }
    }

    pub fn host_dir(&self) -> PathBuf {
        self.root.join(&self.host)
    }

    pub fn destination_dir(&self, date: NaiveDate) -> PathBuf {
        let year_dir = self.host_dir().join(date.format("%Y").to_string());
        if self.unique_id {
            year_dir
        } else {
            year_dir
                .join(date.format("%m").to_string())
                .join(date.format("%d").to_string())
        }
    }

    /// Depth of artifacts below [`host_dir`](Self::host_dir).
    pub fn artifact_depth(&self) -> usize {
        if self.unique_id { 2 } else { 4 }
    }

    /// `<unit>-<YYYY-MM-DD>[_<random6>]<ext>` inside the day's destination directory.
    pub fn unit_artifact_path(&mut self, unit: &str, date: NaiveDate, ext: &str) -> PathBuf {
        let dir = self.destination_dir(date);
        let stem = format!("{}-{}", unit, date.format("%Y-%m-%d"));
        let name = self.next_name(&dir, &stem, ext);
        dir.join(name)
    }

    /// `<DD>[_<random6>]<ext>` inside the day's destination directory.
    pub fn batch_artifact_path(&mut self, date: NaiveDate, ext: &str) -> PathBuf {
        let dir = self.destination_dir(date);
        let stem = date.format("%d").to_string();
        let name = self.next_name(&dir, &stem, ext);
        dir.join(name)
    }

    fn next_name(&mut self, dir: &Path, stem: &str, ext: &str) -> String {
        if !self.unique_id {
            return format!("{}{}", stem, ext);
        }
        loop {
            let name = format!("{}_{}{}", stem, random_suffix(), ext);
            if !self.issued.contains(&name) && !dir.join(&name).exists() {
                self.issued.insert(name.clone());
                return name;
            }
        }
    }
}

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Matches every artifact name a unit can have produced, whatever its date, suffix or extension.
pub fn unit_matcher(unit: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"^{}-\d{{4}}-\d{{2}}-\d{{2}}{SUFFIX_PATTERN}{EXT_PATTERN}$",
        regex::escape(unit)
    ))
    .with_context(|| format!("Failed to build artifact pattern for {}", unit))
}

/// Matches batch artifacts of the same day-of-month bucket.
pub fn batch_matcher(date: NaiveDate) -> Result<Regex> {
    Regex::new(&format!(
        r"^{}{SUFFIX_PATTERN}{EXT_PATTERN}$",
        date.format("%d")
    ))
    .context("Failed to build batch artifact pattern")
}

/// Recovers the database name from a per-unit artifact name.
pub fn unit_from_artifact_name(name: &str) -> Option<String> {
    UNIT_ARTIFACT
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// True for names a per-batch run produces, whatever the day.
pub fn is_batch_artifact_name(name: &str) -> bool {
    BATCH_ARTIFACT.is_match(name)
}
