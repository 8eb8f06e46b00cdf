// dbbackup/src/utils/lock.rs
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};

/// A lock file younger than this without a readable PID may still be being written.
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

/// Exclusive run lock. The file holds the owner's PID and is removed on drop,
/// so every exit path out of the guarded scope releases it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

enum Holder {
    Alive(i32),
    Stale(Option<i32>),
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // A second attempt only happens after a stale lock was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!("Acquired run lock {}", path.display());
                    return Ok(Self { path: path.to_path_buf() });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match current_holder(path) {
                    Holder::Alive(pid) => {
                        return Err(BackupError::LockHeld { path: path.to_path_buf(), pid });
                    }
                    Holder::Stale(pid) => {
                        warn!(
                            "Reclaiming stale lock {} left by pid {}",
                            path.display(),
                            pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
                        );
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        let pid = match current_holder(path) {
            Holder::Alive(pid) => pid,
            Holder::Stale(pid) => pid.unwrap_or(0),
        };
        Err(BackupError::LockHeld { path: path.to_path_buf(), pid })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Released run lock {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }
}

fn current_holder(path: &Path) -> Holder {
    let pid = fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0);

    match pid {
        Some(pid) if process_alive(pid) => Holder::Alive(pid),
        Some(pid) => Holder::Stale(Some(pid)),
        None => {
            let fresh = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age < UNREADABLE_GRACE);
            if fresh { Holder::Alive(0) } else { Holder::Stale(None) }
        }
    }
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 only probes; EPERM means the process exists under another user.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
