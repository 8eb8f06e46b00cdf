// dbbackup/src/backends/influxdb.rs
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{DumpBackend, Endpoint, run_tool};
use crate::config::ConnectionConfig;

const DEFAULT_HTTP_PORT: u16 = 8086;
const DEFAULT_RPC_PORT: u16 = 8088;

/// InfluxDB 1.x through the `influx` shell and `influxd backup/restore -portable`.
pub struct InfluxBackend {
    endpoint: Endpoint,
    rpc_port: u16,
}

impl InfluxBackend {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::resolve(connection, DEFAULT_HTTP_PORT)?,
            rpc_port: connection.rpc_port.unwrap_or(DEFAULT_RPC_PORT),
        })
    }

    fn shell(&self) -> Command {
        let mut cmd = Command::new("influx");
        cmd.arg("-host")
            .arg(&self.endpoint.host)
            .arg("-port")
            .arg(self.endpoint.port.to_string());
        if let Some(user) = &self.endpoint.username {
            cmd.arg("-username").arg(user);
        }
        if let Some(password) = &self.endpoint.password {
            cmd.env("INFLUX_PASSWORD", password);
        }
        cmd
    }

    fn rpc_address(&self) -> String {
        format!("{}:{}", self.endpoint.host, self.rpc_port)
    }

    async fn show_databases(&self) -> Result<Vec<String>> {
        let output = run_tool(
            self.shell()
                .arg("-format")
                .arg("csv")
                .arg("-execute")
                .arg("SHOW DATABASES"),
            "influx",
        )
        .await?;
        Ok(parse_show_databases(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `SHOW DATABASES` csv output (`name,name` header, then `databases,<db>` rows).
fn parse_show_databases(csv: &str) -> Vec<String> {
    csv.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("name,"))
        .filter_map(|line| line.rsplit(',').next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl DumpBackend for InfluxBackend {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["influx", "influxd"]
    }

    fn system_units(&self) -> &'static [&'static str] {
        &["_internal"]
    }

    async fn check_connectivity(&self) -> Result<()> {
        self.show_databases().await.map(|_| ())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        self.show_databases().await
    }

    async fn dump(&self, unit: &str, target_dir: &Path) -> Result<PathBuf> {
        let output_path = target_dir.join(unit);
        run_tool(
            Command::new("influxd")
                .arg("backup")
                .arg("-portable")
                .arg("-host")
                .arg(self.rpc_address())
                .arg("-db")
                .arg(unit)
                .arg(&output_path),
            "influxd backup",
        )
        .await?;
        Ok(output_path)
    }

    async fn restore(&self, source_unit: &str, dump_path: &Path, target_unit: &str) -> Result<()> {
        let mut cmd = Command::new("influxd");
        cmd.arg("restore")
            .arg("-portable")
            .arg("-host")
            .arg(self.rpc_address())
            .arg("-db")
            .arg(source_unit);
        if source_unit != target_unit {
            cmd.arg("-newdb").arg(target_unit);
        }
        run_tool(cmd.arg(dump_path), "influxd restore").await?;
        Ok(())
    }
}
