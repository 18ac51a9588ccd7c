//! Per-probe advisory exclusive locks.
//!
//! One lock file per probe id under the lock directory. The held advisory
//! lock is the exclusion primitive; the file's existence means nothing, so
//! stale files left by crashed owners are harmless. The OS releases the
//! lock when the holding descriptor closes, which ties lock lifetime to the
//! owning task through `Drop`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another dispatch currently owns the probe.
    #[error("probe {0} is busy")]
    Busy(u32),

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A held exclusive lock on one probe. Dropping the value releases the
/// lock; the lock file stays behind.
pub struct ProbeLock {
    file: File,
    probe_id: u32,
    path: PathBuf,
}

impl std::fmt::Debug for ProbeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeLock")
            .field("probe_id", &self.probe_id)
            .field("path", &self.path)
            .finish()
    }
}

impl ProbeLock {
    /// Try to acquire the exclusive lock for `probe_id`, without blocking.
    pub fn try_acquire(lock_dir: &Path, probe_id: u32) -> Result<Self, LockError> {
        std::fs::create_dir_all(lock_dir).map_err(|source| LockError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let path = lock_dir.join(format!("probe_{probe_id}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        try_flock_exclusive(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                LockError::Busy(probe_id)
            } else {
                LockError::Io {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;

        let mut lock = ProbeLock {
            file,
            probe_id,
            path,
        };
        lock.write_owner_info();
        debug!(probe_id, path = %lock.path.display(), "probe lock acquired");
        Ok(lock)
    }

    pub fn probe_id(&self) -> u32 {
        self.probe_id
    }

    /// Record who holds the lock, for operators poking at the lock dir.
    /// Informational only; the advisory lock is the source of truth.
    fn write_owner_info(&mut self) {
        let info = format!(
            "pid={}\nprobe_id={}\nacquired_at={}\n",
            std::process::id(),
            self.probe_id,
            chrono::Utc::now().to_rfc3339(),
        );
        let _ = self.file.set_len(0);
        let _ = self.file.write_all(info.as_bytes());
        let _ = self.file.flush();
    }
}

impl Drop for ProbeLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the advisory lock; nothing else
        // to do. The file is deliberately left in place.
        debug!(probe_id = self.probe_id, "probe lock released");
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `file` is a valid open File, so `as_raw_fd()` returns a valid
    // descriptor, and it stays valid for the duration of the call because we
    // hold a reference to `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = ProbeLock::try_acquire(dir.path(), 1).expect("first acquire");
        assert_eq!(lock.probe_id(), 1);

        // flock is per open-file-description, so a second open of the same
        // path conflicts even within one process.
        match ProbeLock::try_acquire(dir.path(), 1) {
            Err(LockError::Busy(1)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }

        drop(lock);
        ProbeLock::try_acquire(dir.path(), 1).expect("reacquire after drop");
    }

    #[test]
    fn distinct_probes_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _a = ProbeLock::try_acquire(dir.path(), 1).unwrap();
        let _b = ProbeLock::try_acquire(dir.path(), 2).expect("other probe is free");
    }

    #[test]
    fn stale_lock_file_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("probe_3.lock");
        std::fs::write(&stale, "pid=99999\n").unwrap();
        // The file exists but nobody holds the flock, so acquisition works.
        let lock = ProbeLock::try_acquire(dir.path(), 3).expect("stale file ignored");
        drop(lock);
        assert!(stale.exists(), "lock file persists after release");
    }
}
