//! Folder store and grouping index
//!
//! Folders are `/`-separated paths. They exist either explicitly, as a
//! folder record under `folders/`, or implicitly because some record's
//! grouping key names them. Explicit folder records persist while empty.
//!
//! The grouping index is purely in memory and rebuilt from the records on
//! open. Root-level records are grouped under the empty path.

use crate::fsutil;
use docvault_common::{Error, Record, RecordKey, Result, now_rfc3339};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding folder records, relative to the data directory
pub const FOLDERS_DIR: &str = "folders";

/// Normalize a folder path: trim separators, collapse empty segments.
/// Returns `None` for the root.
pub fn normalize_folder(path: &str) -> Option<String> {
    let joined = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

/// Whether `path` is `ancestor` itself or lies beneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Rewrite `path` from under `old` to under `new` (`None` = root).
///
/// Returns `None` if `path` is not within `old`, otherwise the new path,
/// which is itself `None` when the result is the root.
pub fn substitute_prefix(path: &str, old: &str, new: Option<&str>) -> Option<Option<String>> {
    if !is_within(path, old) {
        return None;
    }
    let rest = path[old.len()..].trim_start_matches('/');
    let moved = match (new, rest.is_empty()) {
        (Some(new), true) => Some(new.to_string()),
        (Some(new), false) => Some(format!("{new}/{rest}")),
        (None, true) => None,
        (None, false) => Some(rest.to_string()),
    };
    Some(moved)
}

/// `a/b/c` → `a/b`; top-level folders have no parent
pub fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// `a/b/c` → `c`
pub fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// `a/b/c` → `a`, `a/b`, `a/b/c`
pub fn with_ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(move |(i, _)| &path[..i])
        .chain(std::iter::once(path))
}

/// Flat, reversible file name for a folder path
fn encode_file_name(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 5);
    for c in path.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out.push_str(".json");
    out
}

/// Persisted folder record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub folder_path: String,
    pub name: String,
    #[serde(default)]
    pub parent_folder: Option<String>,
    pub created_date: String,
    /// Caller-supplied fields stored alongside
    #[serde(flatten)]
    pub extra: Record,
}

impl FolderRecord {
    fn new(path: &str, mut extra: Record) -> Self {
        for reserved in ["folder_path", "name", "parent_folder", "created_date"] {
            extra.remove(reserved);
        }
        Self {
            folder_path: path.to_string(),
            name: name_of(path).to_string(),
            parent_folder: parent_of(path).map(str::to_string),
            created_date: now_rfc3339(),
            extra,
        }
    }

    fn relocated(&self, path: &str) -> Self {
        Self {
            folder_path: path.to_string(),
            name: name_of(path).to_string(),
            parent_folder: parent_of(path).map(str::to_string),
            created_date: self.created_date.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Folder records on disk plus their in-memory map
pub struct FolderStore {
    dir: PathBuf,
    folders: BTreeMap<String, FolderRecord>,
}

impl FolderStore {
    /// Open the folder directory and load every folder record
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut folders = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fsutil::read_json::<FolderRecord>(&path) {
                Ok(Some(record)) => match normalize_folder(&record.folder_path) {
                    Some(normalized) => {
                        folders.insert(normalized, record);
                    }
                    None => warn!("ignoring folder record with empty path: {:?}", path),
                },
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable folder record {:?}: {}", path, e),
            }
        }

        debug!("loaded {} folder records from {:?}", folders.len(), dir);
        Ok(Self { dir, folders })
    }

    /// Create a folder; an existing folder is returned unchanged.
    /// The flag is `true` if a new record was written.
    pub fn create(&mut self, path: &str, extra: Record) -> Result<(FolderRecord, bool)> {
        let path = normalize_folder(path)
            .ok_or_else(|| Error::invalid_argument("folder path must not be empty"))?;
        if let Some(existing) = self.folders.get(&path) {
            return Ok((existing.clone(), false));
        }

        let record = FolderRecord::new(&path, extra);
        self.write(&record)?;
        self.folders.insert(path, record.clone());
        Ok((record, true))
    }

    pub fn get(&self, path: &str) -> Option<&FolderRecord> {
        normalize_folder(path).and_then(|p| self.folders.get(&p))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Explicitly created folder paths, sorted
    pub fn list_explicit(&self) -> impl Iterator<Item = &str> {
        self.folders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Remove one folder record
    pub fn remove(&mut self, path: &str) -> Result<bool> {
        let Some(path) = normalize_folder(path) else {
            return Ok(false);
        };
        if self.folders.remove(&path).is_none() {
            return Ok(false);
        }
        fsutil::remove_if_exists(&self.file_for(&path))?;
        Ok(true)
    }

    /// Remove a folder record and all descendants; returns removed paths
    pub fn remove_tree(&mut self, path: &str) -> Result<Vec<String>> {
        let victims: Vec<String> = self
            .folders
            .keys()
            .filter(|p| is_within(p, path))
            .cloned()
            .collect();
        for victim in &victims {
            self.folders.remove(victim);
            fsutil::remove_if_exists(&self.file_for(victim))?;
        }
        Ok(victims)
    }

    /// Move the folder records of a subtree.
    ///
    /// Returns `(old, new)` pairs. `new` is `None` for the subtree root when
    /// moving to root, since the root needs no record. If the destination
    /// already has a record it is kept and the source record is dropped.
    pub fn rename_tree(
        &mut self,
        old: &str,
        new: Option<&str>,
    ) -> Result<Vec<(String, Option<String>)>> {
        let sources: Vec<String> = self
            .folders
            .keys()
            .filter(|p| is_within(p, old))
            .cloned()
            .collect();

        let mut moves = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(record) = self.folders.remove(&source) else {
                continue;
            };
            let target = substitute_prefix(&source, old, new).flatten();
            if let Some(target) = &target {
                if !self.folders.contains_key(target) {
                    let moved = record.relocated(target);
                    self.write(&moved)?;
                    self.folders.insert(target.clone(), moved);
                }
            }
            fsutil::remove_if_exists(&self.file_for(&source))?;
            moves.push((source, target));
        }
        Ok(moves)
    }

    fn file_for(&self, path: &str) -> PathBuf {
        self.dir.join(encode_file_name(path))
    }

    fn write(&self, record: &FolderRecord) -> Result<()> {
        fsutil::write_json_atomic(&self.file_for(&record.folder_path), record)
    }
}

/// In-memory grouping key → record keys map
#[derive(Debug, Default)]
pub struct GroupIndex {
    groups: BTreeMap<String, BTreeSet<RecordKey>>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: Option<&str>, key: RecordKey) {
        self.groups
            .entry(group.unwrap_or_default().to_string())
            .or_default()
            .insert(key);
    }

    pub fn remove(&mut self, group: Option<&str>, key: &RecordKey) {
        let group = group.unwrap_or_default();
        if let Some(members) = self.groups.get_mut(group) {
            members.remove(key);
            if members.is_empty() {
                self.groups.remove(group);
            }
        }
    }

    /// Keys in `group` (the root when empty), optionally with every
    /// descendant group
    pub fn members(&self, group: &str, include_descendants: bool) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();

        if include_descendants {
            let nested: Box<dyn Iterator<Item = (&String, &BTreeSet<RecordKey>)> + '_> =
                if group.is_empty() {
                    Box::new(self.groups.iter().filter(|(g, _)| !g.is_empty()))
                } else {
                    let prefix = format!("{group}/");
                    Box::new(
                        self.groups
                            .range(prefix.clone()..)
                            .take_while(move |(g, _)| g.starts_with(&prefix)),
                    )
                };
            for (_, members) in nested {
                keys.extend(members.iter().cloned());
            }
        }
        keys
    }

    /// Non-root grouping keys currently in use, sorted
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups
            .keys()
            .filter(|g| !g.is_empty())
            .map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
