//! Process-wide exclusive lock backed by a lock file
//!
//! Writers hold the lock across the whole mutation (WAL append, record
//! write, index update, index save). The lock is advisory: it only
//! excludes other holders of the same lock file path on the same
//! filesystem.
//!
//! Backends:
//! - Unix: `flock(LOCK_EX | LOCK_NB)` via `nix`
//! - Other platforms: `File::try_lock` (`LockFileEx` on Windows)

#[cfg(unix)]
#[path = "unix.rs"]
mod backend;

#[cfg(not(unix))]
#[path = "portable.rs"]
mod backend;

use docvault_common::{Error, Result, now_rfc3339};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lock file name inside the data directory
pub const LOCK_FILE: &str = "db.lock";

/// Diagnostic content of a held lock file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub timestamp: String,
}

/// Exclusive lock on a lock file path
#[derive(Clone, Debug)]
pub struct ExclusiveLock {
    path: PathBuf,
    poll_interval: Duration,
}

impl ExclusiveLock {
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Block until the lock is held or `timeout` elapses
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        loop {
            if let Some(mut held) = backend::try_lock(&self.path)? {
                if let Err(e) = write_holder(held.file_mut()) {
                    let _ = held.release(&self.path);
                    return Err(e.into());
                }
                debug!("acquired {:?} after {:?}", self.path, start.elapsed());
                return Ok(LockGuard {
                    held: Some(held),
                    path: self.path.clone(),
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::LockTimeout {
                    path: self.path.display().to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Single non-blocking attempt
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        match self.acquire(Duration::ZERO) {
            Ok(guard) => Ok(Some(guard)),
            Err(Error::LockTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Who holds the lock, if the lock file is present and readable
    pub fn holder(&self) -> Option<LockHolder> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A held lock; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    held: Option<backend::HeldLock>,
    path: PathBuf,
}

impl LockGuard {
    /// Release the lock and remove the lock file
    pub fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(held) => held.release(&self.path).map_err(Error::from),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            if let Err(e) = held.release(&self.path) {
                warn!("failed to release lock {:?}: {}", self.path, e);
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

fn write_holder(file: &mut File) -> std::io::Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        timestamp: now_rfc3339(),
    };
    let bytes = serde_json::to_vec(&holder)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_data()
}
