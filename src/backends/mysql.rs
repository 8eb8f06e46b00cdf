// dbbackup/src/backends/mysql.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, MySqlConnection};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{DumpBackend, Endpoint, run_tool};
use crate::config::ConnectionConfig;

const DEFAULT_PORT: u16 = 3306;
const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

pub struct MySqlBackend {
    endpoint: Endpoint,
}

impl MySqlBackend {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::resolve(connection, DEFAULT_PORT)?,
        })
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        let url = self.endpoint.url("mysql", None, true)?;
        MySqlConnection::connect(&url).await.with_context(|| {
            format!(
                "Failed to connect to MySQL server at {}:{}",
                self.endpoint.host, self.endpoint.port
            )
        })
    }

    /// Client command with connection flags. The password travels in `MYSQL_PWD`
    /// so it never shows up in the process list.
    fn client(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-h")
            .arg(&self.endpoint.host)
            .arg("-P")
            .arg(self.endpoint.port.to_string());
        if let Some(user) = &self.endpoint.username {
            cmd.arg("-u").arg(user);
        }
        if let Some(password) = &self.endpoint.password {
            cmd.env("MYSQL_PWD", password);
        }
        cmd
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[async_trait]
impl DumpBackend for MySqlBackend {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["mysql", "mysqldump"]
    }

    fn system_units(&self) -> &'static [&'static str] {
        SYSTEM_DATABASES
    }

    async fn check_connectivity(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.ping().await.context("MySQL server did not answer ping")?;
        conn.close().await.ok();
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        let mut conn = self.connect().await?;
        // CAST avoids VARBINARY schema names on some server versions.
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT CAST(SCHEMA_NAME AS CHAR) FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME",
        )
        .fetch_all(&mut conn)
        .await
        .context("Failed to fetch database list from information_schema")?;
        conn.close().await.ok();
        Ok(names)
    }

    async fn dump(&self, unit: &str, target_dir: &Path) -> Result<PathBuf> {
        let output_path = target_dir.join(format!("{}.sql", unit));
        run_tool(
            self.client("mysqldump")
                .arg("--single-transaction")
                .arg("--routines")
                .arg("--triggers")
                .arg("--events")
                .arg(format!("--result-file={}", output_path.display()))
                .arg(unit),
            "mysqldump",
        )
        .await?;
        Ok(output_path)
    }

    async fn restore(&self, _source_unit: &str, dump_path: &Path, target_unit: &str) -> Result<()> {
        run_tool(
            self.client("mysql")
                .arg("-e")
                .arg(format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(target_unit))),
            "mysql",
        )
        .await?;

        let dump = File::open(dump_path)
            .with_context(|| format!("Failed to open dump file {}", dump_path.display()))?;
        run_tool(
            self.client("mysql").arg(target_unit).stdin(Stdio::from(dump)),
            "mysql",
        )
        .await?;
        Ok(())
    }
}
