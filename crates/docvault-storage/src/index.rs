//! Global index
//!
//! Maps every record key to where and what it is, persisted as a single
//! `index.json` that is replaced atomically on each save. Presence in the
//! index is what makes a record visible to reads.

use crate::fsutil;
use docvault_common::{RecordKey, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Index file name inside the data directory
pub const INDEX_FILE: &str = "index.json";

/// Per-record index entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Display name copied from the record
    #[serde(default)]
    pub filename: Option<String>,
    /// Grouping key (folder path), `None` for root-level records
    #[serde(default)]
    pub folder: Option<String>,
    /// Shard directory name
    pub shard: String,
    /// Record file path relative to the data directory
    pub path: String,
    /// Last write time (RFC 3339)
    pub updated: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    last_id: u64,
    #[serde(default)]
    documents: BTreeMap<RecordKey, IndexEntry>,
}

/// In-memory index with its backing file
#[derive(Debug)]
pub struct GlobalIndex {
    path: PathBuf,
    last_id: u64,
    documents: BTreeMap<RecordKey, IndexEntry>,
}

impl GlobalIndex {
    /// Load the index; a missing or unreadable file yields an empty index
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match fsutil::read_json::<IndexFile>(&path) {
            Ok(Some(file)) => file,
            Ok(None) => IndexFile::default(),
            Err(e) => {
                warn!("starting with an empty index, {:?} is unreadable: {}", path, e);
                IndexFile::default()
            }
        };

        // last_id must cover every numeric key even if the file under-reports it
        let max_numeric = file
            .documents
            .keys()
            .filter_map(RecordKey::as_numeric)
            .max()
            .unwrap_or(0);

        debug!("loaded {} index entries from {:?}", file.documents.len(), path);
        Self {
            path,
            last_id: file.last_id.max(max_numeric),
            documents: file.documents,
        }
    }

    /// Atomically persist the index
    pub fn save(&self) -> Result<()> {
        fsutil::write_atomic(&self.path, &self.encode()?)
    }

    /// Serialized file content, so the write can happen without holding
    /// whatever guards the index
    pub fn encode(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct IndexFileRef<'a> {
            last_id: u64,
            documents: &'a BTreeMap<RecordKey, IndexEntry>,
        }

        Ok(serde_json::to_vec_pretty(&IndexFileRef {
            last_id: self.last_id,
            documents: &self.documents,
        })?)
    }

    /// Insert or replace an entry, returning the previous one
    pub fn put(&mut self, key: RecordKey, entry: IndexEntry) -> Option<IndexEntry> {
        if let Some(n) = key.as_numeric() {
            self.observe_id(n);
        }
        self.documents.insert(key, entry)
    }

    pub fn remove(&mut self, key: &RecordKey) -> Option<IndexEntry> {
        self.documents.remove(key)
    }

    pub fn get(&self, key: &RecordKey) -> Option<&IndexEntry> {
        self.documents.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.documents.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &IndexEntry)> {
        self.documents.iter()
    }

    /// Highest numeric key ever stored
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Raise `last_id` to at least `id`
    pub fn observe_id(&mut self, id: u64) {
        self.last_id = self.last_id.max(id);
    }

    /// Reserve the next numeric key, skipping any already in use
    pub fn allocate_id(&mut self) -> RecordKey {
        let mut next = self.last_id.saturating_add(1);
        while self.documents.contains_key(&RecordKey::Numeric(next)) {
            next = next.saturating_add(1);
        }
        self.last_id = next;
        RecordKey::Numeric(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
