use std::path::PathBuf;
use thiserror::Error;

/// Conditions that stop a run before any database is dumped.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required executable '{tool}' not found in PATH")]
    MissingTool { tool: String },

    #[error("Cannot reach {backend} server: {reason}")]
    Unreachable { backend: String, reason: String },

    #[error("No databases selected for backup")]
    NoUnits,

    #[error(
        "Insufficient disk space on {}: {available} bytes available, {required} bytes required",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Another run holds the lock {} (pid {pid})", path.display())]
    LockHeld { path: PathBuf, pid: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Name of the check that raised the error, used as the synthetic unit name in reports.
    pub fn check_name(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "configuration",
            BackupError::MissingTool { .. } => "dependencies",
            BackupError::Unreachable { .. } | BackupError::NoUnits => "connectivity",
            BackupError::InsufficientSpace { .. } => "disk-space",
            BackupError::LockHeld { .. } => "lock",
            BackupError::Io(_) => "filesystem",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
