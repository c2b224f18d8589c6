//! Core type definitions for DocVault
//!
//! Records are opaque JSON objects. The only structure the store imposes
//! is the record key, normalized here.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// A stored record: field name to JSON value
pub type Record = Map<String, Value>;

/// Normalized record key
///
/// Numeric keys shard by range; named keys shard by hash. Both render
/// to the same string that names the record file and the index entry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Numeric(u64),
    Named(String),
}

impl RecordKey {
    /// Parse a key from its string form
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".into()));
        }
        // Any digit string that fits in a u64 is numeric, so every
        // `Numeric` renders to a string that parses back to itself.
        // Leading zeros and overflowing values stay named.
        if s.bytes().all(|b| b.is_ascii_digit()) && (s.len() == 1 || !s.starts_with('0')) {
            if let Ok(n) = s.parse::<u64>() {
                return Ok(Self::Numeric(n));
            }
        }
        if s == "." || s == ".." {
            return Err(Error::InvalidKey(format!("'{s}' is reserved")));
        }
        if s.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
            return Err(Error::InvalidKey(format!(
                "'{}' contains a path separator or control character",
                s.escape_default()
            )));
        }
        Ok(Self::Named(s.to_string()))
    }

    /// Extract a key from a record field value
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Self::Numeric)
                .ok_or_else(|| Error::InvalidKey(format!("numeric key {n} is not a u64"))),
            Value::String(s) => Self::parse(s),
            other => Err(Error::InvalidKey(format!(
                "key must be a string or number, got {other}"
            ))),
        }
    }

    /// JSON value written back into the record's key field
    pub fn to_value(&self) -> Value {
        match self {
            Self::Numeric(n) => Value::from(*n),
            Self::Named(s) => Value::from(s.as_str()),
        }
    }

    pub fn as_numeric(&self) -> Option<u64> {
        match self {
            Self::Numeric(n) => Some(*n),
            Self::Named(_) => None,
        }
    }

    /// Record file name: `{key}.json`
    pub fn file_name(&self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Named(s) => f.write_str(s),
        }
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({self})")
    }
}

impl std::str::FromStr for RecordKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<u64> for RecordKey {
    fn from(n: u64) -> Self {
        Self::Numeric(n)
    }
}

impl Serialize for RecordKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Current time as an RFC 3339 UTC string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current time in unix milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
