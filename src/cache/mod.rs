//! Persistent cache store for offline support.
//!
//! This module provides a namespaced blob store that:
//! - Partitions entries into named namespaces (a static and a dynamic one per version)
//! - Keys entries by canonical request identity (method + URL)
//! - Tags every entry as a cached read or a pending write awaiting replay
//! - Tracks a ready flag per namespace so half-populated versions are never current

mod storage;
mod traits;

pub use storage::{default_data_dir, CacheStore, SqliteStorage};
pub use traits::{CacheEntry, CacheHandle, EntryKind, EntryValue};
