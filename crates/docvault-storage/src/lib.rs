//! DocVault Storage Engine - Embedded record store
//!
//! This crate implements the record storage engine for DocVault:
//! - Sharded one-file-per-record layout with O(1) placement
//! - Global index persisted by atomic rename
//! - Buffered JSON write-ahead log with file-driven recovery
//! - Strict LRU record cache
//! - Cross-process exclusive writer lock
//! - Hierarchical folders with subtree move and delete
//! - Compaction that reconciles the index with the files on disk

pub mod cache;
pub mod engine;
pub mod folder;
pub mod fsutil;
pub mod handle;
pub mod index;
pub mod lock;
pub mod shard;
pub mod wal;

// Re-exports
pub use cache::{CacheStats, CacheStatsSnapshot, RecordCache};
pub use engine::{CREATED_AT_FIELD, CompactionReport, Engine, EngineStats, UPDATED_AT_FIELD};
pub use folder::{FolderRecord, FolderStore, GroupIndex, normalize_folder};
pub use handle::EngineHandle;
pub use index::{GlobalIndex, IndexEntry};
pub use lock::{ExclusiveLock, LockGuard, LockHolder};
pub use shard::{ShardAllocator, ShardLocation};
pub use wal::{WalEntry, WalOp, WriteAheadLog};
