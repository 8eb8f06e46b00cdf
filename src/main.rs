//! Database Backup/Restore Tool
//!
//! Dumps MySQL, PostgreSQL or InfluxDB databases, compresses them, applies
//! retention and mails a report. Also restores a chosen backup.

// dbbackup/src/main.rs
mod backends;
mod backup;
mod config;
mod errors;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::backup::RunStatus;
use crate::errors::BackupError;
use crate::restore::RestoreArgs;
use crate::utils::lock::RunLock;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Log progress to the console even when not attached to a terminal
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a backup of the configured databases
    Backup,
    /// Restore a database from an existing backup
    Restore {
        /// Only consider backups of this database
        #[arg(long)]
        unit: Option<String>,
        /// Number of the backup in the listing (1 is the newest)
        #[arg(long)]
        index: Option<usize>,
        /// Restore into this database instead of the configured target
        #[arg(long)]
        target: Option<String>,
        /// List available backups and exit
        #[arg(long)]
        list: bool,
    },
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<ExitCode> {
    let interactive = cli.verbose || std::io::stdout().is_terminal();

    let app_config = AppConfig::load_from_json(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;
    utils::logger::init(
        utils::logger::level_for(interactive),
        app_config.raw_json_config.log_file.as_deref(),
    )?;

    let command = match cli.command {
        Some(command) => command,
        None if interactive => match prompt_choice()?.as_str() {
            "1" | "backup" => Command::Backup,
            "2" | "restore" => Command::Restore {
                unit: None,
                index: None,
                target: None,
                list: false,
            },
            _ => {
                println!("❌ Invalid choice. Please enter '1' (backup) or '2' (restore).");
                anyhow::bail!("Invalid operation choice");
            }
        },
        None => Command::Backup,
    };

    match command {
        Command::Backup => Ok(run_backup(&app_config).await),
        Command::Restore {
            unit,
            index,
            target,
            list,
        } => {
            let args = RestoreArgs {
                unit,
                index,
                target,
                list_only: list,
            };
            let _lock = if list { None } else { Some(acquire_lock(&app_config)?) };
            match utils::shutdown::until_shutdown(
                restore::run_restore_flow(&app_config, &args, interactive),
                utils::shutdown::wait_for_signal(),
            )
            .await
            {
                Ok(result) => {
                    result.context("Restore process failed")?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(signal) => {
                    // Dropping the flow future kills the restore tool; the lock is released on return.
                    warn!("Received {}, aborting restore", signal);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// One backup run under the configuration's lock. The lock is released when this
/// returns, including after a termination signal.
async fn run_backup(app_config: &AppConfig) -> ExitCode {
    let _lock = match acquire_lock(app_config) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("🚀 Starting Backup Process...");
    match utils::shutdown::until_shutdown(
        backup::run_backup_flow(&app_config.raw_json_config),
        utils::shutdown::wait_for_signal(),
    )
    .await
    {
        Ok(report) => match report.status {
            RunStatus::Success => ExitCode::SUCCESS,
            RunStatus::Failed => ExitCode::FAILURE,
        },
        Err(signal) => {
            // Dropping the flow future kills any running dump; the next run clears its temp files.
            warn!("Received {}, aborting backup", signal);
            ExitCode::FAILURE
        }
    }
}

fn acquire_lock(app_config: &AppConfig) -> Result<RunLock, BackupError> {
    RunLock::acquire(&app_config.lock_path())
}

/// Prompts user to select backup or restore operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
