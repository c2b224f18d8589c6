//! Shard allocation
//!
//! Maps a record key to `documents/{start}-{end}/{key}.json` without
//! scanning any directory. Numeric keys bucket by range, named keys by
//! a stable hash folded into a bounded space, so a shard directory never
//! holds more than `capacity` numeric records and named keys spread over
//! at most `modulus / capacity` shards.

use docvault_common::{RecordKey, Result};
use std::path::{Path, PathBuf};

/// Directory holding the shard directories
pub const DOCUMENTS_DIR: &str = "documents";

/// Where a record lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardLocation {
    /// Shard directory name, e.g. `0-999`
    pub shard_id: String,
    /// Record path relative to the data directory
    pub relative_path: PathBuf,
}

/// Deterministic key → shard mapping
#[derive(Clone, Debug)]
pub struct ShardAllocator {
    root: PathBuf,
    capacity: u64,
    modulus: u64,
}

impl ShardAllocator {
    pub fn new(root: impl AsRef<Path>, capacity: u64, modulus: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            capacity: capacity.max(1),
            modulus: modulus.max(1),
        }
    }

    /// Bucket number used for placement
    pub fn bucket(&self, key: &RecordKey) -> u64 {
        match key {
            RecordKey::Numeric(n) => *n,
            RecordKey::Named(name) => {
                let digest = xxhash_rust::xxh3::xxh3_128(name.as_bytes());
                u64::from(digest as u32) % self.modulus
            }
        }
    }

    /// Shard directory name for a key
    pub fn shard_id(&self, key: &RecordKey) -> String {
        let start = (self.bucket(key) / self.capacity) * self.capacity;
        let end = start.saturating_add(self.capacity - 1);
        format!("{start}-{end}")
    }

    /// Compute the location of a key
    pub fn locate(&self, key: &RecordKey) -> ShardLocation {
        let shard_id = self.shard_id(key);
        let relative_path = Path::new(DOCUMENTS_DIR)
            .join(&shard_id)
            .join(key.file_name());
        ShardLocation {
            shard_id,
            relative_path,
        }
    }

    /// Absolute path of a location-relative path
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Create the shard directory for a location and return the record's
    /// absolute path
    pub fn ensure(&self, location: &ShardLocation) -> Result<PathBuf> {
        let dir = self.root.join(DOCUMENTS_DIR).join(&location.shard_id);
        std::fs::create_dir_all(&dir)?;
        Ok(self.absolute(&location.relative_path))
    }

    /// Root of all shard directories
    pub fn documents_dir(&self) -> PathBuf {
        self.root.join(DOCUMENTS_DIR)
    }
}
