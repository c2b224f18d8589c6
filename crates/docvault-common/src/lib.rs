//! DocVault Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, and record key
//! types shared by the storage engine and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, OrphanPolicy, RecordSchema};
pub use error::{Error, Result};
pub use types::{Record, RecordKey, now_millis, now_rfc3339};
