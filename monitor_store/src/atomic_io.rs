// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Crash-safe replacement of small state files.
//!
//! Sequence reservations and journal checkpoints are rewritten in full: the
//! new bytes go to a uniquely named sibling, are synced, then renamed over
//! the target. After a crash the file holds either the old or the new
//! contents.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AtomicIoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Path has no parent directory: {0}")]
    NoParentDir(PathBuf),
}

impl From<AtomicIoError> for io::Error {
    fn from(e: AtomicIoError) -> Self {
        match e {
            AtomicIoError::Io(io_err) => io_err,
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AtomicIoError>;

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| AtomicIoError::NoParentDir(path.to_path_buf()))
}

fn staging_path(path: &Path, parent: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("state");
    parent.join(format!(".{}.staging.{}", file_name, Uuid::new_v4()))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Replace `path` with `data` atomically, creating parent directories.
pub fn atomic_write(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = parent_of(path)?;
    fs::create_dir_all(parent)?;

    let staging = staging_path(path, parent);
    let written = (|| -> io::Result<()> {
        let mut file = File::create(&staging)?;
        file.write_all(data)?;
        file.sync_all()
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }

    fs::rename(&staging, path)?;
    fsync_dir(parent)?;
    Ok(())
}

/// Read the whole file, or `None` if it does not exist.
pub fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    match fs::read(path.as_ref()) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("seq");

        atomic_write(&path, b"x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_no_staging_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq");
        atomic_write(&path, b"x").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".staging."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(read_if_exists(&path).unwrap().is_none());

        atomic_write(&path, b"now here").unwrap();
        assert_eq!(read_if_exists(&path).unwrap().unwrap(), b"now here");
    }

    #[test]
    fn test_bare_file_name_has_no_parent() {
        let err = atomic_write("bare", b"x").unwrap_err();
        assert!(matches!(err, AtomicIoError::NoParentDir(_)));
    }
}
