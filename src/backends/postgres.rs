// dbbackup/src/backends/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use super::{DumpBackend, Endpoint, run_tool};
use crate::config::ConnectionConfig;

const DEFAULT_PORT: u16 = 5432;
const ADMIN_DATABASE: &str = "postgres";

pub struct PostgresBackend {
    endpoint: Endpoint,
}

impl PostgresBackend {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::resolve(connection, DEFAULT_PORT)?,
        })
    }

    async fn connect_admin(&self) -> Result<PgConnection> {
        let url = self.endpoint.url("postgres", Some(ADMIN_DATABASE), true)?;
        PgConnection::connect(&url).await.with_context(|| {
            format!(
                "Failed to connect to '{}' database on {}:{}",
                ADMIN_DATABASE, self.endpoint.host, self.endpoint.port
            )
        })
    }

    /// pg_* client pointed at `database`; the password goes through `PGPASSWORD`.
    fn client(&self, program: &str, database: &str) -> Result<Command> {
        let mut cmd = Command::new(program);
        cmd.arg("-d").arg(self.endpoint.url("postgres", Some(database), false)?);
        if let Some(password) = &self.endpoint.password {
            cmd.env("PGPASSWORD", password);
        }
        Ok(cmd)
    }

    async fn create_database_if_not_exists(&self, db_name: &str) -> Result<()> {
        let mut conn = self.connect_admin().await?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut conn)
            .await
            .with_context(|| format!("Failed to check existence of database '{}'", db_name))?;

        if !exists {
            info!("Creating database '{}'", db_name);
            let mut create_sql = format!(r#"CREATE DATABASE "{}""#, db_name.replace('"', "\"\""));
            if let Some(owner) = &self.endpoint.username {
                create_sql.push_str(&format!(r#" OWNER "{}""#, owner.replace('"', "\"\"")));
            }
            sqlx::query(&create_sql)
                .execute(&mut conn)
                .await
                .with_context(|| format!("Failed to create database '{}'", db_name))?;
        }
        conn.close().await.ok();
        Ok(())
    }
}

#[async_trait]
impl DumpBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["pg_dump", "pg_restore"]
    }

    fn system_units(&self) -> &'static [&'static str] {
        &[ADMIN_DATABASE]
    }

    async fn check_connectivity(&self) -> Result<()> {
        let mut conn = self.connect_admin().await?;
        conn.ping().await.context("PostgreSQL server did not answer ping")?;
        conn.close().await.ok();
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        let mut conn = self.connect_admin().await?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await
        .context("Failed to fetch database list from pg_database")?;
        conn.close().await.ok();
        Ok(names)
    }

    async fn dump(&self, unit: &str, target_dir: &Path) -> Result<PathBuf> {
        let output_path = target_dir.join(format!("{}.dump", unit));
        run_tool(
            self.client("pg_dump", unit)?
                .arg("--format=custom")
                .arg("-f")
                .arg(&output_path),
            "pg_dump",
        )
        .await?;
        Ok(output_path)
    }

    async fn restore(&self, _source_unit: &str, dump_path: &Path, target_unit: &str) -> Result<()> {
        self.create_database_if_not_exists(target_unit).await?;
        run_tool(
            self.client("pg_restore", target_unit)?
                .arg("--no-owner")
                .arg("--no-privileges")
                .arg("--exit-on-error")
                .arg(dump_path),
            "pg_restore",
        )
        .await?;
        Ok(())
    }
}
