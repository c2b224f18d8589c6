//! flock(2) backend

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

pub(super) struct HeldLock(Flock<File>);

/// One non-blocking attempt; `Ok(None)` if someone else holds it
pub(super) fn try_lock(path: &Path) -> io::Result<Option<HeldLock>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(locked) => locked,
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
        Err((_, errno)) => return Err(errno.into()),
    };

    // The previous holder unlinks the file on release. If that happened
    // between our open and our flock we locked a dead inode: retry.
    let ours = locked.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) if current.dev() == ours.dev() && current.ino() == ours.ino() => {
            Ok(Some(HeldLock(locked)))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl HeldLock {
    pub(super) fn file_mut(&mut self) -> &mut File {
        &mut self.0
    }

    /// Unlink while still locked, then unlock; waiters that opened the
    /// old inode notice the mismatch and retry.
    pub(super) fn release(self, path: &Path) -> io::Result<()> {
        let removed = match std::fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        self.0.unlock().map_err(|(_, errno)| io::Error::from(errno))?;
        removed
    }
}
