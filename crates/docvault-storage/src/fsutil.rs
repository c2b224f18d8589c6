//! File helpers shared by the index, record, and folder writers
//!
//! Every persistent file is replaced with write-temp, fsync, rename so a
//! crash leaves either the old or the new content, never a torn file.

use docvault_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Suffix for in-flight temp files
pub const TEMP_SUFFIX: &str = "tmp";

/// Temp file path next to `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::storage(format!(
            "failed to rename {} into place: {}",
            tmp.display(),
            e
        )));
    }
    sync_parent(path);
    Ok(())
}

/// Atomically replace `path` with the pretty JSON form of `value`
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read and parse a JSON file; `Ok(None)` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        Error::Serialization(format!("malformed JSON in {}: {}", path.display(), e))
    })
}

/// Remove a file; `Ok(false)` if it was already gone
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether a directory entry is a leftover temp file
pub fn is_temp_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TEMP_SUFFIX)
}

// Directory fsync makes the rename itself durable. Not supported on every
// platform, so failures are ignored.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
