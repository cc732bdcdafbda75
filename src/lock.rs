//! Advisory run lock, so overlapping cron invocations never rotate twice.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Holds an exclusive lock on the lock file until dropped.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Take the lock without waiting.
    ///
    /// Fails if another instance holds it. The file is opened with
    /// create+read+write so creation and locking do not race.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let lock_path = path.as_ref();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another instance of ipflip is already running.\n\
                 If you believe this is an error, remove the lock file: {}",
                lock_path.display()
            )
        })?;

        Ok(Self {
            _file: file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipflip.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(guard.path(), path.as_path());
        drop(guard);

        LockGuard::acquire(&path).unwrap();
    }

    #[test]
    fn test_second_lock_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipflip.lock");

        let _guard = LockGuard::acquire(&path).unwrap();
        let err = LockGuard::acquire(&path).err().unwrap();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("ipflip.lock");

        LockGuard::acquire(&path).unwrap();
        assert!(path.exists());
    }
}
