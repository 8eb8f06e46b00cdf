// dbbackup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tar::Builder;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::BackupError;

const ZSTD_LEVEL: i32 = 3;

/// Supported archive formats. All of them are tar containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 4] = [
        ArchiveFormat::Gzip,
        ArchiveFormat::Bzip2,
        ArchiveFormat::Xz,
        ArchiveFormat::Zstd,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Gzip => ".tar.gz",
            ArchiveFormat::Bzip2 => ".tar.bz2",
            ArchiveFormat::Xz => ".tar.xz",
            ArchiveFormat::Zstd => ".tar.zst",
        }
    }

    /// gzip and zstd are written in-process; the others go through the system `tar`.
    pub fn required_tool(&self) -> Option<&'static str> {
        match self {
            ArchiveFormat::Gzip | ArchiveFormat::Zstd => None,
            ArchiveFormat::Bzip2 | ArchiveFormat::Xz => Some("tar"),
        }
    }

    fn tar_flag(&self) -> &'static str {
        match self {
            ArchiveFormat::Gzip => "z",
            ArchiveFormat::Bzip2 => "j",
            ArchiveFormat::Xz => "J",
            ArchiveFormat::Zstd => "a",
        }
    }

    /// Detects the format of an existing artifact from its file name.
    pub fn from_path(path: &Path) -> Option<ArchiveFormat> {
        let name = path.file_name()?.to_str()?;
        Self::ALL.into_iter().find(|f| name.ends_with(f.extension()))
    }
}

impl FromStr for ArchiveFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" | "tar.gz" | "tgz" => Ok(ArchiveFormat::Gzip),
            "bzip2" | "bz2" | "tar.bz2" => Ok(ArchiveFormat::Bzip2),
            "xz" | "tar.xz" => Ok(ArchiveFormat::Xz),
            "zstd" | "zst" | "tar.zst" => Ok(ArchiveFormat::Zstd),
            other => Err(BackupError::Config(format!(
                "Unsupported compression format '{}', expected one of gzip, bzip2, xz, zstd",
                other
            ))),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::Gzip => "gzip",
            ArchiveFormat::Bzip2 => "bzip2",
            ArchiveFormat::Xz => "xz",
            ArchiveFormat::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Creates a compressed tar archive holding `entries`, each a path relative to `base_dir`.
///
/// Entries keep their relative names inside the archive, so `base_dir/shop/shop.sql`
/// added as `shop` unpacks to `shop/shop.sql`. The archive is written inside `base_dir`
/// first and only renamed onto `archive_dest_path` once complete, so a failed or
/// interrupted run never truncates an existing artifact of the same name.
///
/// # Returns
/// Size of the archive in bytes.
pub fn create_archive(
    format: ArchiveFormat,
    base_dir: &Path,
    entries: &[String],
    archive_dest_path: &Path,
) -> Result<u64> {
    if let Some(parent) = archive_dest_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create parent directory for archive: {}", parent.display())
        })?;
    }

    let file_name = archive_dest_path
        .file_name()
        .with_context(|| format!("Archive path has no file name: {}", archive_dest_path.display()))?;
    let staged = base_dir.join(format!(".{}.partial", file_name.to_string_lossy()));

    let written = write_archive(format, base_dir, entries, &staged)
        .and_then(|()| publish(&staged, archive_dest_path));
    if let Err(e) = written {
        if staged.exists() {
            if let Err(rm) = fs::remove_file(&staged) {
                warn!("Failed to remove partial archive {}: {}", staged.display(), rm);
            }
        }
        return Err(e);
    }

    let size = fs::metadata(archive_dest_path)
        .with_context(|| format!("Failed to stat archive {}", archive_dest_path.display()))?
        .len();
    Ok(size)
}

/// Moves a finished archive onto its final name.
///
/// Across filesystems the copy goes to a hidden temporary file next to `dest` first,
/// so `dest` itself only ever changes by rename.
fn publish(staged: &Path, dest: &Path) -> Result<()> {
    if fs::rename(staged, dest).is_ok() {
        return Ok(());
    }
    let parent = dest
        .parent()
        .with_context(|| format!("Archive path has no parent: {}", dest.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    let mut src = File::open(staged).with_context(|| format!("Failed to open {}", staged.display()))?;
    io::copy(&mut src, tmp.as_file_mut())
        .with_context(|| format!("Failed to copy {} to {}", staged.display(), parent.display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move archive into place at {}", dest.display()))?;
    fs::remove_file(staged).with_context(|| format!("Failed to remove {}", staged.display()))?;
    Ok(())
}

fn write_archive(
    format: ArchiveFormat,
    base_dir: &Path,
    entries: &[String],
    archive_dest_path: &Path,
) -> Result<()> {
    match format {
        ArchiveFormat::Gzip => {
            let file = create_file(archive_dest_path)?;
            let enc = GzEncoder::new(file, Compression::default());
            let enc = append_entries(enc, base_dir, entries)?;
            enc.finish()
                .and_then(|mut w| w.flush())
                .with_context(|| format!("Failed to finish gzip stream for {}", archive_dest_path.display()))
        }
        ArchiveFormat::Zstd => {
            let file = create_file(archive_dest_path)?;
            let enc = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)
                .context("Failed to initialise zstd encoder")?;
            let enc = append_entries(enc, base_dir, entries)?;
            enc.finish()
                .and_then(|mut w| w.flush())
                .with_context(|| format!("Failed to finish zstd stream for {}", archive_dest_path.display()))
        }
        ArchiveFormat::Bzip2 | ArchiveFormat::Xz => run_tar(
            Command::new("tar")
                .arg(format!("-c{}f", format.tar_flag()))
                .arg(archive_dest_path)
                .arg("-C")
                .arg(base_dir)
                .arg("--")
                .args(entries),
        ),
    }
}

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create archive file: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn append_entries<W: Write>(writer: W, base_dir: &Path, entries: &[String]) -> Result<W> {
    let mut tar_builder = Builder::new(writer);
    tar_builder.follow_symlinks(false);

    for entry in entries {
        let path = base_dir.join(entry);
        if path.is_dir() {
            tar_builder.append_dir_all(entry, &path).with_context(|| {
                format!("Failed to append directory {} to archive", path.display())
            })?;
        } else {
            tar_builder.append_path_with_name(&path, entry).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), entry)
            })?;
        }
    }

    tar_builder
        .into_inner()
        .context("Failed to finish tar stream")
}

/// Extracts an archive produced by [`create_archive`] into `extract_to_dir`.
pub fn extract_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    let format = ArchiveFormat::from_path(archive_path).with_context(|| {
        format!("Unrecognised archive extension: {}", archive_path.display())
    })?;
    fs::create_dir_all(extract_to_dir).with_context(|| {
        format!("Failed to create extraction directory: {}", extract_to_dir.display())
    })?;

    match format {
        ArchiveFormat::Gzip => {
            let file = File::open(archive_path)
                .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
            tar::Archive::new(flate2::read::GzDecoder::new(file))
                .unpack(extract_to_dir)
                .with_context(|| format!("Failed to unpack archive {}", archive_path.display()))?;
        }
        ArchiveFormat::Zstd => {
            let file = File::open(archive_path)
                .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
            let decoder = zstd::stream::read::Decoder::new(file).context("Failed to initialise zstd decoder")?;
            tar::Archive::new(decoder)
                .unpack(extract_to_dir)
                .with_context(|| format!("Failed to unpack archive {}", archive_path.display()))?;
        }
        ArchiveFormat::Bzip2 | ArchiveFormat::Xz => run_tar(
            Command::new("tar")
                .arg(format!("-x{}f", format.tar_flag()))
                .arg(archive_path)
                .arg("-C")
                .arg(extract_to_dir),
        )?,
    }

    Ok(extract_to_dir.to_path_buf())
}

fn run_tar(cmd: &mut Command) -> Result<()> {
    let output = cmd.output().context("Failed to execute tar command")?;
    if !output.status.success() {
        anyhow::bail!(
            "tar failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Size of a file, or the recursive size of every file below a directory.
pub fn path_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", path.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

/// Removes a file or directory tree.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Moves `from` to `to`, replacing whatever is already at `to`.
///
/// Falls back to copy-and-delete when a rename is not possible (different filesystems).
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    if fs::symlink_metadata(to).is_ok() {
        remove_path(to).with_context(|| format!("Failed to replace existing {}", to.display()))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_path(from, to)?;
    remove_path(from).with_context(|| format!("Failed to remove {} after copy", from.display()))?;
    Ok(())
}

/// Copies a file or directory tree.
pub fn copy_path(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        fs::copy(from, to)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        return Ok(());
    }
    for entry in WalkDir::new(from) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("Failed to strip prefix {}", from.display()))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(base: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(base.join("shop"))?;
        fs::write(base.join("shop/shop.sql"), b"CREATE TABLE orders (id INT);\n")?;
        fs::create_dir_all(base.join("metrics/shard1"))?;
        fs::write(base.join("metrics/shard1/data.bin"), vec![7u8; 4096])?;
        Ok(())
    }

    #[test]
    fn test_format_parse_and_extension() {
        assert_eq!("gz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Gzip);
        assert_eq!("ZSTD".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zstd);
        assert_eq!("bzip2".parse::<ArchiveFormat>().unwrap().extension(), ".tar.bz2");
        assert!(matches!("lz4".parse::<ArchiveFormat>(), Err(BackupError::Config(_))));
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/b/shop-2024-03-07_aB3dE9.tar.xz")),
            Some(ArchiveFormat::Xz)
        );
        assert_eq!(ArchiveFormat::from_path(Path::new("/b/shop-2024-03-07.sql")), None);
    }

    #[test]
    fn test_gzip_archive_unpacks_to_same_tree() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        sample_tree(src.path())?;
        let out = tempfile::tempdir()?;
        let archive = out.path().join("nested/07.tar.gz");

        let size = create_archive(
            ArchiveFormat::Gzip,
            src.path(),
            &["shop".to_string(), "metrics".to_string()],
            &archive,
        )?;
        assert!(size > 0);
        assert_eq!(size, fs::metadata(&archive)?.len());

        let unpacked = out.path().join("unpacked");
        extract_archive(&archive, &unpacked)?;
        assert_eq!(
            fs::read_to_string(unpacked.join("shop/shop.sql"))?,
            "CREATE TABLE orders (id INT);\n"
        );
        assert_eq!(fs::read(unpacked.join("metrics/shard1/data.bin"))?.len(), 4096);
        Ok(())
    }

    #[test]
    fn test_zstd_archive_of_single_file() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        sample_tree(src.path())?;
        let archive = src.path().join("shop.tar.zst");

        create_archive(ArchiveFormat::Zstd, &src.path().join("shop"), &["shop.sql".to_string()], &archive)?;

        let unpacked = src.path().join("out");
        extract_archive(&archive, &unpacked)?;
        assert!(unpacked.join("shop.sql").is_file());
        Ok(())
    }

    #[test]
    fn test_failed_archive_leaves_nothing_behind() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let archive = src.path().join("broken.tar.gz");
        let result = create_archive(ArchiveFormat::Gzip, src.path(), &["missing".to_string()], &archive);
        assert!(result.is_err());
        assert!(!archive.exists());
        assert!(fs::read_dir(src.path())?.next().is_none());
        Ok(())
    }

    #[test]
    fn test_failed_archive_keeps_existing_artifact() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        sample_tree(src.path())?;
        let out = tempfile::tempdir()?;
        let archive = out.path().join("shop-2024-03-07.tar.gz");
        create_archive(ArchiveFormat::Gzip, src.path(), &["shop".to_string()], &archive)?;
        let earlier = fs::read(&archive)?;

        let result = create_archive(ArchiveFormat::Gzip, src.path(), &["missing".to_string()], &archive);

        assert!(result.is_err());
        assert_eq!(fs::read(&archive)?, earlier);
        assert!(!src.path().join(".shop-2024-03-07.tar.gz.partial").exists());
        assert_eq!(fs::read_dir(out.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_archive_replaces_existing_artifact_when_complete() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        sample_tree(src.path())?;
        let out = tempfile::tempdir()?;
        let archive = out.path().join("07.tar.gz");
        fs::write(&archive, b"earlier run")?;

        let size = create_archive(ArchiveFormat::Gzip, src.path(), &["shop".to_string()], &archive)?;

        assert_eq!(size, fs::metadata(&archive)?.len());
        let unpacked = out.path().join("unpacked");
        extract_archive(&archive, &unpacked)?;
        assert!(unpacked.join("shop/shop.sql").is_file());
        Ok(())
    }

    #[test]
    fn test_path_size_is_recursive() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        sample_tree(src.path())?;
        assert_eq!(path_size(&src.path().join("metrics"))?, 4096);
        assert_eq!(path_size(&src.path().join("shop/shop.sql"))?, 30);
        Ok(())
    }

    #[test]
    fn test_move_path_replaces_existing_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        sample_tree(root.path())?;
        let dest = root.path().join("final/metrics");
        fs::create_dir_all(dest.join("stale"))?;

        move_path(&root.path().join("metrics"), &dest)?;
        assert!(!root.path().join("metrics").exists());
        assert!(!dest.join("stale").exists());
        assert!(dest.join("shard1/data.bin").is_file());
        Ok(())
    }
}
