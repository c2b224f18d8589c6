//! std file-lock backend for non-unix targets

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, ErrorKind};
use std::path::Path;

pub(super) struct HeldLock(File);

/// One non-blocking attempt; `Ok(None)` if someone else holds it
pub(super) fn try_lock(path: &Path) -> io::Result<Option<HeldLock>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock() {
        Ok(()) => Ok(Some(HeldLock(file))),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(e)) => Err(e),
    }
}

impl HeldLock {
    pub(super) fn file_mut(&mut self) -> &mut File {
        &mut self.0
    }

    /// Windows refuses to delete an open file, so unlock and close first.
    /// A waiter may grab the lock in between; the removal then fails with a
    /// sharing violation and the file simply stays.
    pub(super) fn release(self, path: &Path) -> io::Result<()> {
        self.0.unlock()?;
        drop(self.0);
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::PermissionDenied => {
                Ok(())
            }
            other => other,
        }
    }
}
