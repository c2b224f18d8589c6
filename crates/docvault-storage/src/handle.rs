//! Async handle for use from tokio tasks
//!
//! Every engine call does blocking file I/O and may wait on the exclusive
//! lock, so each one is moved onto tokio's blocking pool.

use crate::engine::{CompactionReport, Engine, EngineStats};
use crate::folder::FolderRecord;
use docvault_common::{EngineConfig, Error, Record, RecordKey, Result};
use std::sync::Arc;

/// Cloneable async front for a shared [`Engine`]
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

impl EngineHandle {
    /// Open an engine on the blocking pool
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let engine = tokio::task::spawn_blocking(move || Engine::open(config))
            .await
            .map_err(|e| Error::internal(format!("engine open task failed: {e}")))??;
        Ok(Self::new(engine))
    }

    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// The shared engine, for synchronous callers
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| Error::internal(format!("blocking engine task failed: {e}")))?
    }

    pub async fn create(&self, record: Record) -> Result<Record> {
        self.run(move |engine| engine.create(record)).await
    }

    pub async fn get(&self, key: RecordKey) -> Result<Option<Record>> {
        self.run(move |engine| engine.get(&key)).await
    }

    pub async fn exists(&self, key: RecordKey) -> Result<bool> {
        self.run(move |engine| Ok(engine.exists(&key))).await
    }

    pub async fn update(&self, key: RecordKey, patch: Record) -> Result<Option<Record>> {
        self.run(move |engine| engine.update(&key, patch)).await
    }

    pub async fn delete(&self, key: RecordKey) -> Result<bool> {
        self.run(move |engine| engine.delete(&key)).await
    }

    pub async fn find_by_secondary_key(&self, value: String) -> Result<Option<Record>> {
        self.run(move |engine| engine.find_by_secondary_key(&value))
            .await
    }

    pub async fn find_all_by_secondary_key(&self, value: String) -> Result<Vec<Record>> {
        self.run(move |engine| engine.find_all_by_secondary_key(&value))
            .await
    }

    pub async fn list_by_group(
        &self,
        group: String,
        include_descendants: bool,
    ) -> Result<Vec<Record>> {
        self.run(move |engine| engine.list_by_group(&group, include_descendants))
            .await
    }

    pub async fn list_all(&self) -> Result<Vec<Record>> {
        self.run(Engine::list_all).await
    }

    pub async fn list_ungrouped(&self) -> Result<Vec<Record>> {
        self.run(Engine::list_ungrouped).await
    }

    pub async fn create_folder(&self, path: String, extra: Record) -> Result<FolderRecord> {
        self.run(move |engine| engine.create_folder(&path, extra))
            .await
    }

    pub async fn get_folder(&self, path: String) -> Result<Option<FolderRecord>> {
        self.run(move |engine| Ok(engine.get_folder(&path))).await
    }

    pub async fn list_folders(&self) -> Result<Vec<String>> {
        self.run(|engine| Ok(engine.list_folders())).await
    }

    pub async fn delete_group(&self, path: String) -> Result<usize> {
        self.run(move |engine| engine.delete_group(&path)).await
    }

    pub async fn move_group(&self, old: String, new: Option<String>) -> Result<usize> {
        self.run(move |engine| engine.move_group(&old, new.as_deref()))
            .await
    }

    pub async fn compact(&self) -> Result<CompactionReport> {
        self.run(Engine::compact).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        self.run(|engine| Ok(engine.stats())).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.run(Engine::flush).await
    }

    pub async fn close(&self) -> Result<()> {
        self.run(Engine::close).await
    }
}
