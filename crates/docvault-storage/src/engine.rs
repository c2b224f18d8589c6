//! Storage engine
//!
//! Ties the shard allocator, index, cache, WAL, folder store and lock into
//! the record CRUD state machine.
//!
//! Every mutation runs as:
//! ```text
//! writer gate → file lock → WAL append → atomic record write/remove
//!   → commit (cache + maps + index, under the state mutex) → index save
//!   → unlock
//! ```
//!
//! Writers are serialized by the gate, which also owns the WAL. The state
//! mutex is only taken for in-memory work, so reads never wait on disk I/O
//! done by a writer or by compaction.

use crate::cache::{CacheStatsSnapshot, RecordCache};
use crate::folder::{
    FOLDERS_DIR, FolderRecord, FolderStore, GroupIndex, is_within, normalize_folder,
    substitute_prefix, with_ancestors,
};
use crate::fsutil;
use crate::index::{GlobalIndex, INDEX_FILE, IndexEntry};
use crate::lock::{ExclusiveLock, LOCK_FILE, LockGuard};
use crate::shard::{DOCUMENTS_DIR, ShardAllocator, ShardLocation};
use crate::wal::{LOGS_DIR, WAL_FILE, WalOp, WriteAheadLog};
use docvault_common::{
    EngineConfig, Error, OrphanPolicy, Record, RecordKey, Result, now_rfc3339,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Field stamped on create
pub const CREATED_AT_FIELD: &str = "created_at";

/// Field stamped on every write
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Outcome of a compaction pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Index entries whose record file was missing
    pub dropped: usize,
    /// Unindexed record files added to the index
    pub adopted: usize,
    /// Unindexed record files removed
    pub deleted_orphans: usize,
    /// Leftover temp files removed
    pub removed_temp: usize,
}

impl CompactionReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Engine statistics
#[derive(Clone, Debug)]
pub struct EngineStats {
    pub records: usize,
    pub folders: usize,
    pub last_id: u64,
    pub cache_len: usize,
    pub cache_capacity: usize,
    pub cache: CacheStatsSnapshot,
    pub wal_pending: usize,
    pub wal_bytes: u64,
    pub writes_since_compaction: u64,
}

/// In-memory views shared by readers and writers
struct EngineState {
    index: GlobalIndex,
    groups: GroupIndex,
    /// Secondary value → keys, most recently written last
    secondary: HashMap<String, Vec<RecordKey>>,
    secondary_by_key: HashMap<RecordKey, String>,
    /// Bumped on every commit so readers can tell their disk read is stale
    generation: u64,
}

impl EngineState {
    fn link(&mut self, key: &RecordKey, group: Option<&str>, secondary: Option<String>) {
        self.groups.insert(group, key.clone());
        if let Some(value) = secondary {
            let keys = self.secondary.entry(value.clone()).or_default();
            keys.retain(|k| k != key);
            keys.push(key.clone());
            self.secondary_by_key.insert(key.clone(), value);
        }
    }

    fn unlink(&mut self, key: &RecordKey, group: Option<&str>) {
        self.groups.remove(group, key);
        if let Some(value) = self.secondary_by_key.remove(key) {
            if let Some(keys) = self.secondary.get_mut(&value) {
                keys.retain(|k| k != key);
                if keys.is_empty() {
                    self.secondary.remove(&value);
                }
            }
        }
    }
}

/// State only writers touch, owned by the writer gate
struct WriterState {
    wal: WriteAheadLog,
    writes_since_compaction: u64,
}

/// Both levels of writer exclusion; the file lock is released first
struct WriteGuard<'a> {
    _file: LockGuard,
    writer: MutexGuard<'a, WriterState>,
}

/// Embedded record storage engine
pub struct Engine {
    config: EngineConfig,
    root: PathBuf,
    shards: ShardAllocator,
    cache: RecordCache,
    lock: ExclusiveLock,
    /// Serializes writers within this process
    writer: Mutex<WriterState>,
    state: Mutex<EngineState>,
    folders: Mutex<FolderStore>,
}

impl Engine {
    /// Open or create a store, recovering from the WAL
    pub fn open(config: EngineConfig) -> Result<Self> {
        let config = config.validate()?;
        let root = config.data_dir.clone();
        for dir in [DOCUMENTS_DIR, FOLDERS_DIR, LOGS_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        let lock = ExclusiveLock::new(root.join(LOCK_FILE), config.lock_poll_interval());
        let startup_lock = lock.acquire(config.lock_timeout())?;

        let state = EngineState {
            index: GlobalIndex::load(root.join(INDEX_FILE)),
            groups: GroupIndex::new(),
            secondary: HashMap::new(),
            secondary_by_key: HashMap::new(),
            generation: 0,
        };
        let writer = WriterState {
            wal: WriteAheadLog::open(
                root.join(LOGS_DIR).join(WAL_FILE),
                config.wal_flush_threshold,
            )?,
            writes_since_compaction: 0,
        };

        let mut engine = Self {
            shards: ShardAllocator::new(&root, config.shard_capacity, config.hash_modulus),
            cache: RecordCache::new(config.cache_capacity),
            lock,
            writer: Mutex::new(writer),
            state: Mutex::new(state),
            folders: Mutex::new(FolderStore::open(root.join(FOLDERS_DIR))?),
            root,
            config,
        };

        engine.recover()?;
        startup_lock.release()?;

        let folders = engine.folders.get_mut().len();
        let state = engine.state.get_mut();
        info!(
            "opened store at {:?}: {} records, {} folders, last_id {}",
            engine.root,
            state.index.len(),
            folders,
            state.index.last_id()
        );
        Ok(engine)
    }

    /// Create a record; a missing key is allocated
    pub fn create(&self, mut record: Record) -> Result<Record> {
        let mut guard = self.write_guard()?;
        let group = self.group_of(&record)?;

        let key = {
            let mut state = self.state.lock();
            let key = match record.get(&self.config.schema.key_field) {
                None | Some(Value::Null) => state.index.allocate_id(),
                Some(value) => RecordKey::from_value(value)?,
            };
            if state.index.contains(&key) {
                return Err(Error::DuplicateKey(key.to_string()));
            }
            key
        };

        let now = now_rfc3339();
        record.insert(self.config.schema.key_field.clone(), key.to_value());
        if let Some(group) = &group {
            record.insert(self.config.schema.group_field.clone(), json!(group));
        }
        record.insert(CREATED_AT_FIELD.into(), json!(now));
        record.insert(UPDATED_AT_FIELD.into(), json!(now));

        guard
            .writer
            .wal
            .append(WalOp::Create, Value::Object(record.clone()))?;

        let location = self.shards.locate(&key);
        let path = self.shards.ensure(&location)?;
        fsutil::write_json_atomic(&path, &record)?;

        let secondary = self.secondary_of(&record);
        let entry = self.index_entry(&location.shard_id, relative_path(&location), &record, group);
        self.commit(|state| {
            self.cache.put(key.clone(), &record);
            state.link(&key, entry.folder.as_deref(), secondary);
            state.index.put(key.clone(), entry);
        });
        self.save_index()?;

        debug!("created {} in shard {}", key, location.shard_id);
        self.after_write(&mut guard.writer, 1)?;
        Ok(record)
    }

    /// Fetch a record by key
    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let (path, generation) = {
            let state = self.state.lock();
            match state.index.get(key) {
                Some(entry) => (entry.path.clone(), state.generation),
                None => return Ok(None),
            }
        };

        if let Some(record) = self.cache.get(key) {
            return Ok(Some(record));
        }

        let Some(record) = self.read_record(&path)? else {
            return Ok(None);
        };

        // Only populate the cache if no commit raced with our disk read
        let state = self.state.lock();
        if state.generation == generation {
            self.cache.put(key.clone(), &record);
        }
        Ok(Some(record))
    }

    pub fn exists(&self, key: &RecordKey) -> bool {
        self.state.lock().index.contains(key)
    }

    /// Merge `patch` into an existing record
    pub fn update(&self, key: &RecordKey, mut patch: Record) -> Result<Option<Record>> {
        if let Some(value) = patch.remove(&self.config.schema.key_field) {
            if RecordKey::from_value(&value).ok().as_ref() != Some(key) {
                return Err(Error::invalid_argument(format!(
                    "cannot change the key of record {key}"
                )));
            }
        }
        patch.remove(CREATED_AT_FIELD);

        let mut guard = self.write_guard()?;

        let Some(entry) = self.entry_of(key) else {
            return Ok(None);
        };
        let Some(mut record) = self.current(key, &entry)? else {
            warn!("record {} is indexed but its file is missing", key);
            return Ok(None);
        };

        record.extend(patch);
        record.insert(UPDATED_AT_FIELD.into(), json!(now_rfc3339()));
        let group = self.group_of(&record)?;
        if let Some(group) = &group {
            record.insert(self.config.schema.group_field.clone(), json!(group));
        }

        self.rewrite(&mut guard.writer, key, &entry, record.clone(), group)?;
        self.save_index()?;

        debug!("updated {}", key);
        self.after_write(&mut guard.writer, 1)?;
        Ok(Some(record))
    }

    /// Delete a record; `false` if it did not exist
    pub fn delete(&self, key: &RecordKey) -> Result<bool> {
        let mut guard = self.write_guard()?;

        if !self.remove_record(&mut guard.writer, key)? {
            self.cache.delete(key);
            return Ok(false);
        }
        self.save_index()?;

        debug!("deleted {}", key);
        self.after_write(&mut guard.writer, 1)?;
        Ok(true)
    }

    /// Most recently written record with this secondary value
    pub fn find_by_secondary_key(&self, value: &str) -> Result<Option<Record>> {
        let key = self
            .state
            .lock()
            .secondary
            .get(value)
            .and_then(|keys| keys.last().cloned());
        match key {
            Some(key) => self.get(&key),
            None => Ok(None),
        }
    }

    /// Every record with this secondary value, oldest write first
    pub fn find_all_by_secondary_key(&self, value: &str) -> Result<Vec<Record>> {
        let keys = self
            .state
            .lock()
            .secondary
            .get(value)
            .cloned()
            .unwrap_or_default();
        self.get_many(&keys)
    }

    /// Records in a folder, optionally including every subfolder.
    /// The empty path is the root.
    pub fn list_by_group(&self, group: &str, include_descendants: bool) -> Result<Vec<Record>> {
        let group = normalize_folder(group).unwrap_or_default();
        let mut keys = self.state.lock().groups.members(&group, include_descendants);
        keys.sort();
        self.get_many(&keys)
    }

    /// Every record, in key order
    pub fn list_all(&self) -> Result<Vec<Record>> {
        let keys: Vec<RecordKey> = self.state.lock().index.keys().cloned().collect();
        self.get_many(&keys)
    }

    /// Records not in any folder
    pub fn list_ungrouped(&self) -> Result<Vec<Record>> {
        self.list_by_group("", false)
    }

    /// Create a folder record; an existing folder is returned unchanged
    pub fn create_folder(&self, path: &str, extra: Record) -> Result<FolderRecord> {
        let path = normalize_folder(path)
            .ok_or_else(|| Error::invalid_argument("folder path must not be empty"))?;

        let mut guard = self.write_guard()?;
        if let Some(existing) = self.folders.lock().get(&path) {
            return Ok(existing.clone());
        }

        guard
            .writer
            .wal
            .append(WalOp::CreateFolder, json!({ "folder_path": path }))?;
        let (folder, _) = self.folders.lock().create(&path, extra)?;

        debug!("created folder {}", path);
        self.after_write(&mut guard.writer, 1)?;
        Ok(folder)
    }

    pub fn get_folder(&self, path: &str) -> Option<FolderRecord> {
        self.folders.lock().get(path).cloned()
    }

    /// Explicit folders plus every folder implied by a record's grouping
    /// key, ancestors included, sorted
    pub fn list_folders(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self
            .folders
            .lock()
            .list_explicit()
            .map(str::to_string)
            .collect();
        let state = self.state.lock();
        for group in state.groups.groups() {
            all.extend(with_ancestors(group).map(str::to_string));
        }
        all.into_iter().collect()
    }

    /// Delete a folder, its subfolders, and every record inside them.
    /// Returns the number of records deleted.
    pub fn delete_group(&self, path: &str) -> Result<usize> {
        let path = normalize_folder(path)
            .ok_or_else(|| Error::invalid_argument("cannot delete the root folder"))?;

        let mut guard = self.write_guard()?;

        let keys = self.state.lock().groups.members(&path, true);
        let mut deleted = 0;
        for key in &keys {
            if self.remove_record(&mut guard.writer, key)? {
                deleted += 1;
            }
        }

        let removed_folders = {
            let mut folders = self.folders.lock();
            let victims: Vec<String> = folders
                .list_explicit()
                .filter(|p| is_within(p, &path))
                .map(str::to_string)
                .collect();
            for folder in &victims {
                guard
                    .writer
                    .wal
                    .append(WalOp::DeleteFolder, json!({ "folder_path": folder }))?;
            }
            folders.remove_tree(&path)?.len()
        };
        self.save_index()?;

        info!(
            "deleted folder {}: {} records, {} folder records",
            path, deleted, removed_folders
        );
        self.after_write(&mut guard.writer, (deleted + removed_folders) as u64)?;
        Ok(deleted)
    }

    /// Move a folder subtree under a new path (`None` = root).
    /// Returns the number of records moved.
    pub fn move_group(&self, old: &str, new: Option<&str>) -> Result<usize> {
        let old = normalize_folder(old)
            .ok_or_else(|| Error::invalid_argument("cannot move the root folder"))?;
        let new = new.and_then(normalize_folder);
        if new.as_deref() == Some(old.as_str()) {
            return Ok(0);
        }
        if let Some(new) = &new {
            if is_within(new, &old) {
                return Err(Error::invalid_argument(format!(
                    "cannot move {old} into its own subfolder {new}"
                )));
            }
        }

        let mut guard = self.write_guard()?;

        let mut keys = self.state.lock().groups.members(&old, true);
        keys.sort();
        let mut moved = 0;
        for key in &keys {
            let Some(entry) = self.entry_of(key) else {
                continue;
            };
            let Some(mut record) = self.current(key, &entry)? else {
                warn!("skipping {} during move, its file is missing", key);
                continue;
            };
            let Some(target) = entry
                .folder
                .as_deref()
                .and_then(|g| substitute_prefix(g, &old, new.as_deref()))
            else {
                continue;
            };

            let field = self.config.schema.group_field.clone();
            record.insert(field, target.as_deref().map_or(Value::Null, |g| json!(g)));
            record.insert(UPDATED_AT_FIELD.into(), json!(now_rfc3339()));
            self.rewrite(&mut guard.writer, key, &entry, record, target)?;
            moved += 1;
        }

        let folder_moves = {
            let mut folders = self.folders.lock();
            let planned: Vec<(String, Option<String>)> = folders
                .list_explicit()
                .filter_map(|p| {
                    substitute_prefix(p, &old, new.as_deref()).map(|target| (p.to_string(), target))
                })
                .collect();
            for (source, target) in &planned {
                guard
                    .writer
                    .wal
                    .append(WalOp::DeleteFolder, json!({ "folder_path": source }))?;
                if let Some(target) = target {
                    guard
                        .writer
                        .wal
                        .append(WalOp::CreateFolder, json!({ "folder_path": target }))?;
                }
            }
            folders.rename_tree(&old, new.as_deref())?.len()
        };
        self.save_index()?;

        info!(
            "moved folder {} to {}: {} records",
            old,
            new.as_deref().unwrap_or("/"),
            moved
        );
        self.after_write(&mut guard.writer, (moved + folder_moves) as u64)?;
        Ok(moved)
    }

    /// Reconcile the index with the files on disk
    pub fn compact(&self) -> Result<CompactionReport> {
        let mut guard = self.write_guard()?;
        self.compact_locked(&mut guard.writer)
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Engine statistics; the WAL figures wait for an in-flight write
    pub fn stats(&self) -> EngineStats {
        let (records, last_id) = {
            let state = self.state.lock();
            (state.index.len(), state.index.last_id())
        };
        let folders = self.folders.lock().len();
        let writer = self.writer.lock();
        EngineStats {
            records,
            folders,
            last_id,
            cache_len: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            cache: self.cache.stats().snapshot(),
            wal_pending: writer.wal.pending(),
            wal_bytes: writer.wal.size(),
            writes_since_compaction: writer.writes_since_compaction,
        }
    }

    /// Persist buffered WAL entries
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.write_guard()?;
        guard.writer.wal.flush()
    }

    /// Flush the WAL and save the index
    pub fn close(&self) -> Result<()> {
        let mut guard = self.write_guard()?;
        guard.writer.wal.flush()?;
        self.save_index()?;
        info!("closed store at {:?}", self.root);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.root
    }

    // ---- internals ----

    fn write_guard(&self) -> Result<WriteGuard<'_>> {
        let timeout = self.config.lock_timeout();
        let start = Instant::now();
        let writer = self
            .writer
            .try_lock_for(timeout)
            .ok_or_else(|| Error::LockTimeout {
                path: self.lock.path().display().to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            })?;
        let file = self.lock.acquire(timeout.saturating_sub(start.elapsed()))?;
        Ok(WriteGuard {
            _file: file,
            writer,
        })
    }

    /// Apply in-memory changes as one step visible to readers.
    /// Cache updates belong inside `apply` so a racing reader cannot
    /// overwrite them with what it read before the write.
    fn commit<R>(&self, apply: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.state.lock();
        let result = apply(&mut state);
        state.generation += 1;
        result
    }

    /// Persist the index; only serialization happens under the state mutex
    fn save_index(&self) -> Result<()> {
        let bytes = self.state.lock().index.encode()?;
        fsutil::write_atomic(&self.root.join(INDEX_FILE), &bytes)
    }

    fn entry_of(&self, key: &RecordKey) -> Option<IndexEntry> {
        self.state.lock().index.get(key).cloned()
    }

    fn after_write(&self, writer: &mut WriterState, writes: u64) -> Result<()> {
        writer.writes_since_compaction += writes;
        if writer.writes_since_compaction >= self.config.compaction_threshold {
            self.compact_locked(writer)?;
        }
        Ok(())
    }

    /// Replace a record's content in place, keeping its shard
    fn rewrite(
        &self,
        writer: &mut WriterState,
        key: &RecordKey,
        entry: &IndexEntry,
        record: Record,
        group: Option<String>,
    ) -> Result<()> {
        writer
            .wal
            .append(WalOp::Update, Value::Object(record.clone()))?;

        let path = self.root.join(&entry.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fsutil::write_json_atomic(&path, &record)?;

        let secondary = self.secondary_of(&record);
        let updated = self.index_entry(&entry.shard, entry.path.clone(), &record, group);
        self.commit(|state| {
            self.cache.put(key.clone(), &record);
            state.unlink(key, entry.folder.as_deref());
            state.link(key, updated.folder.as_deref(), secondary);
            state.index.put(key.clone(), updated);
        });
        Ok(())
    }

    /// Remove a record without saving the index; `false` if not indexed
    fn remove_record(&self, writer: &mut WriterState, key: &RecordKey) -> Result<bool> {
        let Some(entry) = self.entry_of(key) else {
            return Ok(false);
        };

        let mut data = Record::new();
        data.insert(self.config.schema.key_field.clone(), key.to_value());
        writer.wal.append(WalOp::Delete, Value::Object(data))?;
        fsutil::remove_if_exists(&self.root.join(&entry.path))?;

        self.commit(|state| {
            self.cache.delete(key);
            state.unlink(key, entry.folder.as_deref());
            state.index.remove(key);
        });
        Ok(true)
    }

    /// Current content of an indexed record, for writers holding the gate
    fn current(&self, key: &RecordKey, entry: &IndexEntry) -> Result<Option<Record>> {
        match self.cache.get(key) {
            Some(record) => Ok(Some(record)),
            None => self.read_record(&entry.path),
        }
    }

    fn get_many(&self, keys: &[RecordKey]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get(key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Read a record file; corrupt content is logged and treated as absent
    fn read_record(&self, relative: &str) -> Result<Option<Record>> {
        match fsutil::read_json::<Record>(&self.root.join(relative)) {
            Err(Error::Serialization(msg)) => {
                warn!("treating corrupt record file as absent: {}", msg);
                Ok(None)
            }
            other => other,
        }
    }

    fn group_of(&self, record: &Record) -> Result<Option<String>> {
        match record.get(&self.config.schema.group_field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(normalize_folder(s)),
            Some(other) => Err(Error::InvalidRecord(format!(
                "field '{}' must be a string, got {}",
                self.config.schema.group_field, other
            ))),
        }
    }

    fn secondary_of(&self, record: &Record) -> Option<String> {
        match record.get(&self.config.schema.secondary_field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn index_entry(
        &self,
        shard: &str,
        path: String,
        record: &Record,
        group: Option<String>,
    ) -> IndexEntry {
        IndexEntry {
            filename: record
                .get(&self.config.schema.display_field)
                .and_then(Value::as_str)
                .map(str::to_string),
            folder: group,
            shard: shard.to_string(),
            path,
            updated: record
                .get(UPDATED_AT_FIELD)
                .and_then(Value::as_str)
                .map_or_else(now_rfc3339, str::to_string),
        }
    }

    // ---- recovery and compaction ----

    fn recover(&mut self) -> Result<()> {
        let mut dirty = self.replay_wal()?;
        dirty |= self.rebuild_maps()?;
        if dirty {
            self.state.get_mut().index.save()?;
        }
        Ok(())
    }

    /// Re-derive the index entry of every record the WAL mentions from the
    /// file on disk. Returns whether the index changed.
    fn replay_wal(&mut self) -> Result<bool> {
        let entries = self.writer.get_mut().wal.replay()?;
        if entries.is_empty() {
            return Ok(false);
        }

        let key_field = self.config.schema.key_field.clone();
        let keys: BTreeSet<RecordKey> = entries
            .iter()
            .filter(|e| e.operation.is_record_op())
            .filter_map(|e| e.data.get(&key_field))
            .filter_map(|v| RecordKey::from_value(v).ok())
            .collect();

        let mut changed = 0;
        for key in &keys {
            let (shard, path) = match self.state.get_mut().index.get(key) {
                Some(entry) => (entry.shard.clone(), entry.path.clone()),
                None => {
                    let location = self.shards.locate(key);
                    let path = relative_path(&location);
                    (location.shard_id, path)
                }
            };

            let on_disk = match fsutil::read_json::<Record>(&self.root.join(&path)) {
                Ok(record) => record,
                Err(Error::Serialization(msg)) => {
                    warn!("leaving {} as is during replay: {}", key, msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match on_disk {
                Some(record) => {
                    let group = self.group_of(&record).unwrap_or_default();
                    let entry = self.index_entry(&shard, path, &record, group);
                    let index = &mut self.state.get_mut().index;
                    if index.get(key) != Some(&entry) {
                        index.put(key.clone(), entry);
                        changed += 1;
                    }
                }
                None => {
                    if self.state.get_mut().index.remove(key).is_some() {
                        changed += 1;
                    }
                }
            }
        }

        self.writer.get_mut().writes_since_compaction = entries.len() as u64;
        if changed > 0 {
            warn!(
                "WAL replay repaired {} index entries ({} entries, {} records)",
                changed,
                entries.len(),
                keys.len()
            );
        } else {
            debug!("WAL replay: {} entries, index consistent", entries.len());
        }
        Ok(changed > 0)
    }

    /// Read every indexed record once to rebuild the secondary and group
    /// maps. Entries whose file is missing are dropped.
    fn rebuild_maps(&mut self) -> Result<bool> {
        let indexed: Vec<(RecordKey, IndexEntry)> = self
            .state
            .get_mut()
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();

        let mut loaded = Vec::with_capacity(indexed.len());
        let mut dirty = false;
        for (key, entry) in indexed {
            match fsutil::read_json::<Record>(&self.root.join(&entry.path)) {
                Ok(Some(record)) => loaded.push((key, entry, record)),
                Ok(None) => {
                    warn!("dropping index entry {}, file {} is missing", key, entry.path);
                    self.state.get_mut().index.remove(&key);
                    dirty = true;
                }
                Err(Error::Serialization(msg)) => {
                    warn!("record {} is unreadable: {}", key, msg);
                }
                Err(e) => return Err(e),
            }
        }

        // Oldest first, so the latest write wins each secondary value
        loaded.sort_by(|a, b| a.1.updated.cmp(&b.1.updated));

        for (key, entry, record) in loaded {
            let group = self.group_of(&record).unwrap_or_default();
            let secondary = self.secondary_of(&record);
            let state = self.state.get_mut();
            if entry.folder != group {
                let mut fixed = entry;
                fixed.folder.clone_from(&group);
                state.index.put(key.clone(), fixed);
                dirty = true;
            }
            state.link(&key, group.as_deref(), secondary);
        }
        Ok(dirty)
    }

    /// Compaction proper. The caller holds the writer gate, so the index
    /// only changes through the commits made here; file checks run against
    /// a snapshot of the indexed paths with the state mutex released.
    fn compact_locked(&self, writer: &mut WriterState) -> Result<CompactionReport> {
        let start = Instant::now();
        let mut report = CompactionReport::default();
        writer.wal.flush()?;

        let mut indexed: BTreeMap<RecordKey, IndexEntry> = self
            .state
            .lock()
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();

        // Index entries without a file
        let missing: Vec<RecordKey> = indexed
            .iter()
            .filter(|(_, e)| !self.root.join(&e.path).exists())
            .map(|(k, _)| k.clone())
            .collect();
        for key in missing {
            let Some(entry) = indexed.remove(&key) else {
                continue;
            };
            warn!("compaction: dropping {} whose file is missing", key);
            self.commit(|state| {
                self.cache.delete(&key);
                state.unlink(&key, entry.folder.as_deref());
                state.index.remove(&key);
            });
            report.dropped += 1;
        }

        // Files without an index entry
        for shard_dir in read_dirs(&self.shards.documents_dir())? {
            let shard = shard_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for file in std::fs::read_dir(&shard_dir)? {
                let path = file?.path();
                if fsutil::is_temp_file(&path) {
                    if fsutil::remove_if_exists(&path)? {
                        report.removed_temp += 1;
                    }
                    continue;
                }
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                self.reconcile_file(&mut indexed, &shard, &path, &mut report)?;
            }
        }

        // Temp files next to the index and folder records
        for dir in [self.root.clone(), self.root.join(FOLDERS_DIR)] {
            for file in std::fs::read_dir(&dir)? {
                let path = file?.path();
                if path.is_file() && fsutil::is_temp_file(&path) && fsutil::remove_if_exists(&path)? {
                    report.removed_temp += 1;
                }
            }
        }

        self.save_index()?;
        writer.wal.clear()?;
        writer.writes_since_compaction = 0;

        info!(
            "compaction finished in {:?}: dropped {}, adopted {}, deleted {} orphans, removed {} temp files",
            start.elapsed(),
            report.dropped,
            report.adopted,
            report.deleted_orphans,
            report.removed_temp
        );
        Ok(report)
    }

    /// Apply the orphan policy to one record file
    fn reconcile_file(
        &self,
        indexed: &mut BTreeMap<RecordKey, IndexEntry>,
        shard: &str,
        path: &Path,
        report: &mut CompactionReport,
    ) -> Result<()> {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return Ok(());
        };
        let key = match RecordKey::parse(stem) {
            Ok(key) => key,
            Err(e) => {
                warn!("compaction: ignoring {:?}: {}", path, e);
                return Ok(());
            }
        };
        let relative = format!("{DOCUMENTS_DIR}/{shard}/{}", key.file_name());
        if let Some(entry) = indexed.get(&key) {
            if entry.path != relative {
                warn!(
                    "compaction: {:?} duplicates indexed record {} at {}",
                    path, key, entry.path
                );
            }
            return Ok(());
        }

        match self.config.orphan_policy {
            OrphanPolicy::Delete => {
                if fsutil::remove_if_exists(path)? {
                    warn!("compaction: deleted orphan file {:?}", path);
                    report.deleted_orphans += 1;
                }
            }
            OrphanPolicy::Adopt => {
                let record = match fsutil::read_json::<Record>(path) {
                    Ok(Some(record)) => record,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        warn!("compaction: leaving unreadable orphan {:?}: {}", path, e);
                        return Ok(());
                    }
                };
                let declared = record
                    .get(&self.config.schema.key_field)
                    .map(RecordKey::from_value);
                if let Some(declared) = declared {
                    if declared.ok().as_ref() != Some(&key) {
                        warn!("compaction: leaving orphan {:?}, its key field does not match", path);
                        return Ok(());
                    }
                }

                let group = self.group_of(&record).unwrap_or_default();
                let secondary = self.secondary_of(&record);
                let entry = self.index_entry(shard, relative, &record, group);
                indexed.insert(key.clone(), entry.clone());
                self.commit(|state| {
                    state.link(&key, entry.folder.as_deref(), secondary);
                    state.index.put(key.clone(), entry);
                });
                warn!("compaction: adopted orphan record {}", key);
                report.adopted += 1;
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let writer = self.writer.get_mut();
        if let Err(e) = writer.wal.flush() {
            tracing::error!("failed to flush WAL on drop: {}", e);
        }
    }
}

/// Index path for a location, always `/`-separated
fn relative_path(location: &ShardLocation) -> String {
    location
        .relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine_in(dir: &Path) -> Engine {
        Engine::open(EngineConfig::with_data_dir(dir)).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_get_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());

        let stored = engine
            .create(record(json!({"id": "5", "filename": "a.pdf", "checksum": "abc"})))
            .unwrap();
        assert_eq!(stored["id"], 5);
        assert!(stored.contains_key(CREATED_AT_FIELD));
        assert!(stored.contains_key(UPDATED_AT_FIELD));

        let fetched = engine.get(&RecordKey::Numeric(5)).unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert!(dir.path().join("documents/0-999/5.json").is_file());
    }

    #[test]
    fn test_key_allocation() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine.create(record(json!({"id": 41}))).unwrap();
        let next = engine.create(record(json!({"filename": "b"}))).unwrap();
        assert_eq!(next["id"], 42);

        engine.delete(&RecordKey::Numeric(42)).unwrap();
        let after_delete = engine.create(record(json!({}))).unwrap();
        assert_eq!(after_delete["id"], 43);
    }

    #[test]
    fn test_duplicate_key_rejected_before_write() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.create(record(json!({"id": 1, "filename": "first"}))).unwrap();

        let err = engine
            .create(record(json!({"id": 1, "filename": "second"})))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        let kept = engine.get(&RecordKey::Numeric(1)).unwrap().unwrap();
        assert_eq!(kept["filename"], "first");
        assert_eq!(engine.stats().writes_since_compaction, 1);
    }

    #[test]
    fn test_update_merges_and_keeps_shard() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine
            .create(record(json!({"id": 7, "filename": "a", "tags": ["x"]})))
            .unwrap();

        let updated = engine
            .update(
                &RecordKey::Numeric(7),
                record(json!({"filename": "b", "note": null})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated["filename"], "b");
        assert_eq!(updated["tags"], json!(["x"]));
        assert!(updated["note"].is_null());

        let err = engine
            .update(&RecordKey::Numeric(7), record(json!({"id": 8})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(engine.update(&RecordKey::Numeric(99), Record::new()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_group_field() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        let err = engine
            .create(record(json!({"id": 1, "folder": 12})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_secondary_key_latest_wins() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.create(record(json!({"id": 1, "checksum": "h"}))).unwrap();
        engine.create(record(json!({"id": 2, "checksum": "h"}))).unwrap();

        let found = engine.find_by_secondary_key("h").unwrap().unwrap();
        assert_eq!(found["id"], 2);
        assert_eq!(engine.find_all_by_secondary_key("h").unwrap().len(), 2);

        engine
            .update(&RecordKey::Numeric(1), record(json!({"filename": "touched"})))
            .unwrap();
        assert_eq!(engine.find_by_secondary_key("h").unwrap().unwrap()["id"], 1);
    }

    #[test]
    fn test_move_rejects_own_subtree() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.create_folder("A", Record::new()).unwrap();

        assert!(matches!(
            engine.move_group("A", Some("A/B")),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(engine.move_group("A", Some("/A/")).unwrap(), 0);
        assert!(matches!(
            engine.move_group("/", Some("B")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compaction_threshold_triggers() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            compaction_threshold: 3,
            ..EngineConfig::with_data_dir(dir.path())
        };
        let engine = Engine::open(config).unwrap();

        engine.create(record(json!({"id": 1}))).unwrap();
        engine.create(record(json!({"id": 2}))).unwrap();
        assert_eq!(engine.stats().writes_since_compaction, 2);
        engine.create(record(json!({"id": 3}))).unwrap();
        assert_eq!(engine.stats().writes_since_compaction, 0);
        assert_eq!(engine.stats().wal_bytes, 0);
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let alloc = ShardAllocator::new("/x", 1000, 100_000);
        let loc = alloc.locate(&RecordKey::Numeric(1050));
        assert_eq!(relative_path(&loc), "documents/1000-1999/1050.json");
    }
}
