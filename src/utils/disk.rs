// dbbackup/src/utils/disk.rs
use nix::sys::statvfs::statvfs;
use std::io;
use std::path::Path;

use crate::errors::{BackupError, Result};

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn available_bytes(path: &Path) -> Result<u64> {
    let stat = statvfs(path).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Fails when fewer than `required` bytes are free under `path`. Zero disables the check.
pub fn ensure_free_space(path: &Path, required: u64) -> Result<()> {
    if required == 0 {
        return Ok(());
    }
    let available = available_bytes(path)?;
    if available < required {
        return Err(BackupError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_check() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(available_bytes(dir.path())? > 0);
        ensure_free_space(dir.path(), 0)?;
        ensure_free_space(dir.path(), 1)?;

        let err = ensure_free_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, BackupError::InsufficientSpace { required: u64::MAX, .. }));
        assert_eq!(err.check_name(), "disk-space");
        Ok(())
    }

    #[test]
    fn test_missing_path_is_an_io_error() {
        let err = available_bytes(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, BackupError::Io(_)));
    }
}
