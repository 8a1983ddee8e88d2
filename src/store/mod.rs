//! Versioned storage for flag and segment data.
//!
//! The store holds two collections (flags and segments) keyed by string, each item carrying a
//! version number. Logical deletions are stored as tombstones so that replayed older updates
//! cannot resurrect deleted entities. The data source is the only writer; the evaluator only
//! reads.

pub mod memory;
pub mod persistent;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Flag, Segment};

/// The kinds of data the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flags,
    Segments,
}

impl DataKind {
    /// All kinds, in the order persistent stores should initialize them (segments before flags,
    /// so that readers of a half-initialized store never see a flag whose segments are absent).
    pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Flags];

    /// Namespace used by persistent stores.
    pub fn namespace(self) -> &'static str {
        match self {
            DataKind::Flags => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Path prefix used by the streaming protocol's patch/delete events.
    pub fn stream_path_prefix(self) -> &'static str {
        match self {
            DataKind::Flags => "/flags/",
            DataKind::Segments => "/segments/",
        }
    }
}

/// A stored item: a parsed flag or segment, or a tombstone left by a deletion.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreItem {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
    Tombstone(u64),
}

impl StoreItem {
    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
            StoreItem::Tombstone(version) => *version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, StoreItem::Tombstone(_))
    }

    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            StoreItem::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            StoreItem::Segment(s) => Some(s),
            _ => None,
        }
    }

    /// Parse an item of the given kind from its wire JSON. Deleted items (`"deleted": true`)
    /// become tombstones.
    pub fn parse(kind: DataKind, value: Value) -> serde_json::Result<StoreItem> {
        #[derive(Deserialize)]
        struct DeletedMarker {
            version: u64,
            #[serde(default)]
            deleted: bool,
        }
        if let Ok(marker) = DeletedMarker::deserialize(&value) {
            if marker.deleted {
                return Ok(StoreItem::Tombstone(marker.version));
            }
        }
        Ok(match kind {
            DataKind::Flags => StoreItem::Flag(Arc::new(Flag::deserialize(value)?)),
            DataKind::Segments => StoreItem::Segment(Arc::new(Segment::deserialize(value)?)),
        })
    }
}

/// A full data snapshot, as delivered by the polling endpoint and the streaming `put` event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

/// The data store interface: an atomic snapshot init plus per-item versioned upserts.
pub trait DataStore: Send + Sync {
    /// Atomically replace both collections with a new snapshot and mark the store initialized.
    fn init(&self, all_data: AllData);

    /// Insert or update a single item. The write is ignored if the store already holds an item
    /// with an equal or higher version under this key; returns whether the write took effect.
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> bool;

    /// Get a single item. Tombstones read as `None`.
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;

    /// All live items of a kind (tombstones omitted).
    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem>;

    /// Whether the store has ever received a full snapshot.
    fn is_initialized(&self) -> bool;

    /// Release any background resources held by the store (availability monitors, connections).
    /// Called once during client shutdown, after the data source and event pipeline have
    /// stopped. The in-memory store holds none, hence the default no-op.
    fn close(&self) {}
}

/// Convenience lookup for a flag, skipping tombstones.
pub fn get_flag(store: &dyn DataStore, key: &str) -> Option<Arc<Flag>> {
    store
        .get(DataKind::Flags, key)
        .and_then(|item| item.as_flag().cloned())
}

/// Convenience lookup for a segment, skipping tombstones.
pub fn get_segment(store: &dyn DataStore, key: &str) -> Option<Arc<Segment>> {
    store
        .get(DataKind::Segments, key)
        .and_then(|item| item.as_segment().cloned())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_flag_item() {
        let item = StoreItem::parse(DataKind::Flags, json!({"key": "f", "version": 9})).unwrap();
        assert_eq!(item.version(), 9);
        assert!(item.as_flag().is_some());
    }

    #[test]
    fn parse_tombstone() {
        let item = StoreItem::parse(
            DataKind::Flags,
            json!({"key": "f", "version": 10, "deleted": true}),
        )
        .unwrap();
        assert_eq!(item, StoreItem::Tombstone(10));
    }

    #[test]
    fn parse_error_is_reported() {
        assert!(StoreItem::parse(DataKind::Segments, json!({"key": "s"})).is_err());
    }
}
