//! Write-Ahead Log
//!
//! Newline-delimited JSON, one entry per mutation:
//! ```text
//! {"timestamp":"2026-01-01T00:00:00.000Z","operation":"create","data":{...}}
//! ```
//!
//! Entries are buffered in memory and appended with a single write plus
//! fsync once `flush_threshold` entries are pending, or on explicit
//! [`WriteAheadLog::flush`]. Each entry describes the final state of one
//! record or folder, so replaying an entry twice is harmless.

use docvault_common::{Error, Result, now_rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding the log, relative to the data directory
pub const LOGS_DIR: &str = "logs";

/// Log file name inside [`LOGS_DIR`]
pub const WAL_FILE: &str = "writes.log";

/// Logged operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOp {
    Create,
    Update,
    Delete,
    CreateFolder,
    DeleteFolder,
}

impl WalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateFolder => "create_folder",
            Self::DeleteFolder => "delete_folder",
        }
    }

    /// Whether the entry's payload names a record (vs. a folder)
    pub fn is_record_op(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl std::fmt::Display for WalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub timestamp: String,
    pub operation: WalOp,
    pub data: Value,
}

impl WalEntry {
    pub fn new(operation: WalOp, data: Value) -> Self {
        Self {
            timestamp: now_rfc3339(),
            operation,
            data,
        }
    }
}

/// Buffered append-only log
pub struct WriteAheadLog {
    path: PathBuf,
    buffer: Vec<WalEntry>,
    flush_threshold: usize,
}

impl WriteAheadLog {
    /// Open (creating if needed) the log at `path`
    pub fn open(path: impl AsRef<Path>, flush_threshold: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open WAL {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            buffer: Vec::new(),
            flush_threshold: flush_threshold.max(1),
        })
    }

    /// Buffer an entry, flushing once the threshold is reached
    pub fn append(&mut self, operation: WalOp, data: Value) -> Result<()> {
        self.buffer.push(WalEntry::new(operation, data));
        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist every buffered entry
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(self.buffer.len() * 128);
        for entry in &self.buffer {
            serde_json::to_writer(&mut bytes, entry)?;
            bytes.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;

        debug!("flushed {} WAL entries to {:?}", self.buffer.len(), self.path);
        self.buffer.clear();
        Ok(())
    }

    /// Read persisted entries in order, skipping lines that do not parse
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        Self::read_file(&self.path)
    }

    /// Read the entries of a log file without opening it for writing.
    /// A missing file has no entries and is not created.
    pub fn read_file(path: &Path) -> Result<Vec<WalEntry>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    "skipping malformed WAL line {} in {:?}: {}",
                    lineno + 1,
                    path,
                    e
                ),
            }
        }
        Ok(entries)
    }

    /// Drop buffered and persisted entries
    pub fn clear(&mut self) -> Result<()> {
        self.buffer.clear();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Entries buffered but not yet on disk
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Current log file size in bytes
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush WAL {:?} on drop: {}", self.path, e);
        }
    }
}
