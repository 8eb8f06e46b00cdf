// dbbackup/src/backends/fake.rs
use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::DumpBackend;

/// In-memory server for pipeline tests. Every database dumps to `<unit>.sql`
/// holding a fixed payload; databases listed in `failing` error out like mysqldump does.
pub(crate) struct FakeBackend {
    pub units: Vec<String>,
    pub failing: Vec<String>,
    pub reachable: bool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(units: &[&str]) -> Self {
        Self {
            units: units.iter().map(|u| u.to_string()).collect(),
            failing: Vec::new(),
            reachable: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, unit: &str) -> Self {
        self.failing.push(unit.to_string());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn payload(unit: &str) -> String {
        format!("-- dump of {}\nCREATE TABLE t (id INT);\n", unit)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl DumpBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["sh"]
    }

    fn system_units(&self) -> &'static [&'static str] {
        &["internal"]
    }

    async fn check_connectivity(&self) -> Result<()> {
        self.record("connect".to_string());
        if !self.reachable {
            anyhow::bail!("Can't connect to server on 'localhost' (111)");
        }
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        self.record("list".to_string());
        Ok(self.units.clone())
    }

    async fn dump(&self, unit: &str, target_dir: &Path) -> Result<PathBuf> {
        self.record(format!("dump {}", unit));
        if self.failing.iter().any(|f| f == unit) {
            // Leave something behind to check partial output is removed.
            fs::write(target_dir.join(format!("{}.sql", unit)), b"-- partial")?;
            anyhow::bail!(
                "mysqldump failed with exit status: 2: mysqldump: Got error: 1049: Unknown database '{}' when selecting the database",
                unit
            );
        }
        let output = target_dir.join(format!("{}.sql", unit));
        fs::write(&output, Self::payload(unit))?;
        Ok(output)
    }

    async fn restore(&self, source_unit: &str, dump_path: &Path, target_unit: &str) -> Result<()> {
        let content = fs::read_to_string(dump_path)?;
        if content != Self::payload(source_unit) {
            anyhow::bail!("unexpected dump content for {}", source_unit);
        }
        self.record(format!("restore {} -> {}", source_unit, target_unit));
        Ok(())
    }
}
