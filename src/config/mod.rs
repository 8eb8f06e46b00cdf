// dbbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::backends::BackendKind;
use crate::backup::archive::ArchiveFormat;
use crate::backup::naming::Strategy;
use crate::errors::BackupError;

const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";
const TEMP_DIR_NAME: &str = ".tmp";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonConnection {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub rpc_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCompression {
    pub enabled: bool,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonNotification {
    pub recipient: Option<String>,
    pub sender: Option<String>,
    pub notify_on_start: Option<bool>,
    pub sendmail_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub backend: Option<String>,
    pub connection: Option<JsonConnection>,
    pub destination_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub hostname: Option<String>,
    pub database_list: Option<serde_json::Value>,
    pub exclude_list: Option<Vec<String>>,
    pub compression: Option<JsonCompression>,
    pub strategy: Option<String>,
    pub unique_id: Option<bool>,
    pub retention_count: Option<usize>,
    pub min_free_space_mb: Option<u64>,
    pub notification: Option<JsonNotification>,
    pub log_file: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub rpc_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub recipient: String,
    pub sender: String,
    pub notify_on_start: bool,
    pub sendmail_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backend: BackendKind,
    pub connection: ConnectionConfig,
    pub destination_root: PathBuf,
    pub temp_root: PathBuf,
    pub hostname: String,
    /// Explicit databases; `None` means every database the server lists.
    pub databases_to_backup: Option<Vec<String>>,
    /// Source database -> database name to restore into.
    pub restore_mapping: HashMap<String, String>,
    pub exclude: Vec<String>,
    /// `None` when compression is disabled.
    pub compression: Option<ArchiveFormat>,
    pub strategy: Strategy,
    pub unique_id: bool,
    pub retention_count: usize,
    pub min_free_bytes: u64,
    pub notification: Option<NotificationConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Ok(AppConfig {
            config_path: config_path.to_path_buf(),
            raw_json_config,
        })
    }

    /// Lock file for this configuration. Two invocations with the same config file
    /// share a lock; different config files run independently.
    pub fn lock_path(&self) -> PathBuf {
        if let Some(path) = &self.raw_json_config.lock_file {
            return path.clone();
        }
        let identity = fs::canonicalize(&self.config_path).unwrap_or_else(|_| self.config_path.clone());
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        std::env::temp_dir().join(format!("dbbackup-{:016x}.lock", hasher.finish()))
    }
}

pub fn load_backup_config_from_json(raw_config: &RawJsonConfig) -> Result<BackupConfig, BackupError> {
    let backend: BackendKind = raw_config
        .backend
        .as_deref()
        .ok_or_else(|| BackupError::Config("backend must be set in config.json".into()))?
        .parse()?;

    let destination_root = raw_config
        .destination_dir
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| BackupError::Config("destination_dir must be set in config.json".into()))?;

    let temp_root = raw_config
        .temp_dir
        .clone()
        .unwrap_or_else(|| destination_root.join(TEMP_DIR_NAME));

    let hostname = match &raw_config.hostname {
        Some(name) => name.trim().to_string(),
        None => system_hostname(),
    };
    if hostname.is_empty() || hostname.contains(['/', '\\']) {
        return Err(BackupError::Config(format!("Invalid hostname for destination layout: '{}'", hostname)));
    }

    let strategy: Strategy = match &raw_config.strategy {
        Some(s) => s.parse()?,
        None => Strategy::PerUnit,
    };

    // Unknown formats must fail here, before a single dump has run.
    let compression = match &raw_config.compression {
        Some(c) if c.enabled => Some(c.format.as_deref().unwrap_or("gzip").parse::<ArchiveFormat>()?),
        _ => None,
    };

    let databases_to_backup = parse_database_list_for_backup(&raw_config.database_list)?;
    if let Some(dbs) = &databases_to_backup {
        if let Some(bad) = dbs.iter().find(|name| !is_valid_unit_name(name)) {
            return Err(BackupError::Config(format!(
                "Invalid database name '{}' in database_list",
                bad
            )));
        }
    }

    let json_conn = raw_config.connection.clone().unwrap_or_default();
    let connection = ConnectionConfig {
        url: json_conn.url.filter(|u| !u.trim().is_empty()),
        host: json_conn.host.unwrap_or_else(|| "localhost".to_string()),
        port: json_conn.port,
        rpc_port: json_conn.rpc_port,
        username: json_conn.username.filter(|u| !u.is_empty()),
        password: json_conn.password.filter(|p| !p.is_empty()),
    };

    Ok(BackupConfig {
        backend,
        connection,
        destination_root,
        temp_root,
        databases_to_backup,
        restore_mapping: parse_database_list_for_restore(&raw_config.database_list)?.unwrap_or_default(),
        exclude: raw_config.exclude_list.clone().unwrap_or_default(),
        compression,
        strategy,
        unique_id: raw_config.unique_id.unwrap_or(false),
        retention_count: raw_config.retention_count.unwrap_or(0),
        min_free_bytes: raw_config.min_free_space_mb.unwrap_or(0) * 1024 * 1024,
        notification: notification_from_raw(raw_config, &hostname),
        hostname,
    })
}

/// Notification settings are resolved on their own so a run that fails validation
/// can still mail its report.
pub fn notification_from_raw(raw_config: &RawJsonConfig, hostname: &str) -> Option<NotificationConfig> {
    let notification = raw_config.notification.as_ref()?;
    let recipient = notification.recipient.clone().filter(|r| !r.trim().is_empty())?;
    Some(NotificationConfig {
        recipient,
        sender: notification
            .sender
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("dbbackup@{}", hostname)),
        notify_on_start: notification.notify_on_start.unwrap_or(false),
        sendmail_path: notification
            .sendmail_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SENDMAIL)),
    })
}

pub fn system_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

pub(crate) fn is_valid_unit_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.')
}

/// Parses the database_list configuration for backups
/// Returns a vector of source database names in configured order
fn parse_database_list_for_backup(
    database_list: &Option<serde_json::Value>,
) -> Result<Option<Vec<String>>, BackupError> {
    match database_list {
        Some(value) if value.is_array() => {
            // ["db1", "db2"]
            let databases: Vec<String> = serde_json::from_value(value.clone())
                .map_err(|e| BackupError::Config(format!("Failed to parse database_list as array: {}", e)))?;
            Ok(Some(databases))
        }
        Some(serde_json::Value::Object(mapping)) => {
            // {"source_db": "target_db"}; only the source names are backed up
            Ok(Some(mapping.keys().cloned().collect()))
        }
        Some(_) => Err(BackupError::Config(
            "database_list must be either an array of database names or a mapping object".into(),
        )),
        None => Ok(None),
    }
}

/// Parses the database_list configuration for restore operations
/// Returns a mapping of source database names to target database names
fn parse_database_list_for_restore(
    database_list: &Option<serde_json::Value>,
) -> Result<Option<HashMap<String, String>>, BackupError> {
    match database_list {
        Some(value) if value.is_array() => {
            let databases: Vec<String> = serde_json::from_value(value.clone())
                .map_err(|e| BackupError::Config(format!("Failed to parse database_list as array: {}", e)))?;
            Ok(Some(databases.into_iter().map(|db| (db.clone(), db)).collect()))
        }
        Some(value) if value.is_object() => {
            let mapping: HashMap<String, String> = serde_json::from_value(value.clone())
                .map_err(|e| BackupError::Config(format!("Failed to parse database_list as mapping object: {}", e)))?;
            Ok(Some(mapping))
        }
        Some(_) => Err(BackupError::Config(
            "database_list must be either an array of database names or a mapping object".into(),
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = load_backup_config_from_json(&raw(json!({
            "backend": "mysql",
            "destination_dir": "/srv/backups",
            "hostname": "db01"
        })))?;

        assert_eq!(config.backend, BackendKind::MySql);
        assert_eq!(config.temp_root, PathBuf::from("/srv/backups/.tmp"));
        assert_eq!(config.strategy, Strategy::PerUnit);
        assert!(config.compression.is_none());
        assert!(!config.unique_id);
        assert_eq!(config.retention_count, 0);
        assert_eq!(config.connection.host, "localhost");
        assert!(config.databases_to_backup.is_none());
        assert!(config.notification.is_none());
        Ok(())
    }

    #[test]
    fn test_full_config() -> anyhow::Result<()> {
        let config = load_backup_config_from_json(&raw(json!({
            "backend": "influxdb",
            "connection": { "host": "tsdb", "port": 8086, "rpc_port": 8088 },
            "destination_dir": "/srv/backups",
            "temp_dir": "/var/tmp/dbbackup",
            "hostname": "db01",
            "database_list": ["telegraf", "metrics"],
            "compression": { "enabled": true, "format": "zstd" },
            "strategy": "per_batch",
            "unique_id": true,
            "retention_count": 5,
            "min_free_space_mb": 2,
            "notification": { "recipient": "ops@example.com", "notify_on_start": true }
        })))?;

        assert_eq!(config.backend, BackendKind::InfluxDb);
        assert_eq!(config.compression, Some(ArchiveFormat::Zstd));
        assert_eq!(config.strategy, Strategy::PerBatch);
        assert_eq!(config.retention_count, 5);
        assert_eq!(config.min_free_bytes, 2 * 1024 * 1024);
        assert_eq!(config.databases_to_backup, Some(vec!["telegraf".to_string(), "metrics".to_string()]));
        let notification = config.notification.expect("notification configured");
        assert_eq!(notification.sender, "dbbackup@db01");
        assert!(notification.notify_on_start);
        Ok(())
    }

    #[test]
    fn test_unknown_compression_format_is_config_error() {
        let result = load_backup_config_from_json(&raw(json!({
            "backend": "mysql",
            "destination_dir": "/srv/backups",
            "compression": { "enabled": true, "format": "rar" }
        })));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_disabled_compression_ignores_format() -> anyhow::Result<()> {
        let config = load_backup_config_from_json(&raw(json!({
            "backend": "postgres",
            "destination_dir": "/srv/backups",
            "compression": { "enabled": false, "format": "rar" }
        })))?;
        assert!(config.compression.is_none());
        Ok(())
    }

    #[test]
    fn test_missing_backend_and_destination() {
        let missing_backend = load_backup_config_from_json(&raw(json!({ "destination_dir": "/srv" })));
        assert!(matches!(missing_backend, Err(BackupError::Config(_))));

        let missing_dest = load_backup_config_from_json(&raw(json!({ "backend": "mysql" })));
        assert!(matches!(missing_dest, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_invalid_database_name_rejected() {
        let result = load_backup_config_from_json(&raw(json!({
            "backend": "mysql",
            "destination_dir": "/srv/backups",
            "database_list": ["good", "bad/../name"]
        })));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_parse_database_list_mapping() -> anyhow::Result<()> {
        let value = Some(json!({
            "shop_prod": "shop_staging",
            "analytics": "analytics_copy"
        }));
        let mut sources = parse_database_list_for_backup(&value)?.unwrap();
        sources.sort();
        assert_eq!(sources, vec!["analytics".to_string(), "shop_prod".to_string()]);

        let mapping = parse_database_list_for_restore(&value)?.unwrap();
        assert_eq!(mapping.get("shop_prod"), Some(&"shop_staging".to_string()));
        Ok(())
    }

    #[test]
    fn test_parse_database_list_invalid_format() {
        let value = Some(json!("invalid_string"));
        assert!(parse_database_list_for_backup(&value).is_err());
        assert!(parse_database_list_for_restore(&value).is_err());
    }

    #[test]
    fn test_lock_path_is_stable_per_config() {
        let app = AppConfig {
            config_path: PathBuf::from("/etc/dbbackup/a.json"),
            raw_json_config: RawJsonConfig::default(),
        };
        let other = AppConfig {
            config_path: PathBuf::from("/etc/dbbackup/b.json"),
            raw_json_config: RawJsonConfig::default(),
        };
        assert_eq!(app.lock_path(), app.lock_path());
        assert_ne!(app.lock_path(), other.lock_path());
    }
}
