//! Advisory file lock shared between independent processes.
//!
//! The lock is an exclusive `flock`-style lock on a well known file. It is
//! acquired by polling a non-blocking attempt until a deadline, so a stuck
//! holder surfaces as a [`CommonError::TimeoutError`] instead of a hang.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{CommonError, ErrorContext, Result};

/// Default interval between two lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`, creating the file if needed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_with_poll(path, timeout, DEFAULT_POLL_INTERVAL)
    }

    /// Acquire the lock, retrying every `poll` until `timeout` has elapsed.
    pub fn acquire_with_poll(path: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_io_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_io_context(|| format!("opening lock file {}", path.display()))?;

        let deadline = Instant::now() + timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Giving up on lock {} after {:?}",
                            path.display(),
                            timeout
                        );
                        return Err(CommonError::timeout_error(
                            format!("could not lock {}", path.display()),
                            timeout,
                        ));
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => {
                    return Err(CommonError::io_error_with_source(
                        format!("locking {}", path.display()),
                        e,
                    ));
                }
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("lock");
        let lock = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        let _held = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();

        let err = FileLock::acquire_with_poll(
            &path,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        {
            let _first = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        }
        let second = FileLock::acquire(&path, Duration::from_millis(100));
        assert!(second.is_ok());
    }
}
