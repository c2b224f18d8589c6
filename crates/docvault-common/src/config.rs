//! Configuration types for DocVault
//!
//! Every field has a serde default so a partial TOML table is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory holding `index.json`, `documents/`, `folders/`, `logs/`
    pub data_dir: PathBuf,
    /// Maximum records per shard directory
    pub shard_capacity: u64,
    /// Hash space for non-numeric keys before bucketing
    pub hash_modulus: u64,
    /// Number of records held in the LRU cache (0 disables caching)
    pub cache_capacity: usize,
    /// Buffered WAL entries before a synchronous flush
    pub wal_flush_threshold: usize,
    /// Mutations between automatic compactions
    pub compaction_threshold: u64,
    /// How long a writer waits for the exclusive lock
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting for the exclusive lock
    pub lock_poll_interval_ms: u64,
    /// What compaction does with record files that have no index entry
    pub orphan_policy: OrphanPolicy,
    /// Names of the fields the engine interprets
    pub schema: RecordSchema,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./docvault-data"),
            shard_capacity: 1000,
            hash_modulus: 100_000,
            cache_capacity: 5000,
            wal_flush_threshold: 100,
            compaction_threshold: 10_000,
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 100,
            orphan_policy: OrphanPolicy::default(),
            schema: RecordSchema::default(),
        }
    }
}

impl EngineConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Reject values the engine cannot operate with
    pub fn validate(self) -> Result<Self> {
        if self.shard_capacity == 0 {
            return Err(Error::Configuration("shard_capacity must be > 0".into()));
        }
        if self.hash_modulus == 0 {
            return Err(Error::Configuration("hash_modulus must be > 0".into()));
        }
        if self.wal_flush_threshold == 0 {
            return Err(Error::Configuration(
                "wal_flush_threshold must be > 0".into(),
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(Error::Configuration(
                "compaction_threshold must be > 0".into(),
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "lock_poll_interval_ms must be > 0".into(),
            ));
        }
        self.schema.validate()?;
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

/// Handling of record files found on disk without an index entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Read the file and add it to the index
    #[default]
    Adopt,
    /// Remove the file
    Delete,
}

/// Field names the engine reads from otherwise opaque records
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSchema {
    /// Unique primary key
    pub key_field: String,
    /// Secondary lookup key (content checksum)
    pub secondary_field: String,
    /// Hierarchical grouping key (folder path)
    pub group_field: String,
    /// Human-readable name copied into the index
    pub display_field: String,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            key_field: "id".to_string(),
            secondary_field: "checksum".to_string(),
            group_field: "folder".to_string(),
            display_field: "filename".to_string(),
        }
    }
}

impl RecordSchema {
    fn validate(&self) -> Result<()> {
        let fields = [
            &self.key_field,
            &self.secondary_field,
            &self.group_field,
            &self.display_field,
        ];
        if fields.iter().any(|f| f.is_empty()) {
            return Err(Error::Configuration("schema field names must not be empty".into()));
        }
        if self.key_field == self.secondary_field || self.key_field == self.group_field {
            return Err(Error::Configuration(
                "key_field must differ from secondary_field and group_field".into(),
            ));
        }
        Ok(())
    }
}
