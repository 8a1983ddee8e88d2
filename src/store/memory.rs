//! The default, in-memory data store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{AllData, DataKind, DataStore, StoreItem};

/// A thread-safe in-memory [`DataStore`]. Reads take a shared lock and never block each other;
/// `init` swaps both collections under the write lock.
#[derive(Default)]
pub struct InMemoryDataStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
    initialized: bool,
}

impl Inner {
    fn items(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn items_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, all_data: AllData) {
        let flags = all_data
            .flags
            .into_iter()
            .map(|(k, f)| (k, StoreItem::Flag(Arc::new(f))))
            .collect();
        let segments = all_data
            .segments
            .into_iter()
            .map(|(k, s)| (k, StoreItem::Segment(Arc::new(s))))
            .collect();

        let mut inner = self.inner.write().expect("data store lock poisoned");
        inner.flags = flags;
        inner.segments = segments;
        inner.initialized = true;
        log::debug!(target: "launchdarkly",
            flags = inner.flags.len(), segments = inner.segments.len();
            "initialized in-memory data store");
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> bool {
        let mut inner = self.inner.write().expect("data store lock poisoned");
        let items = inner.items_mut(kind);
        match items.get(key) {
            Some(existing) if existing.version() >= item.version() => {
                log::debug!(target: "launchdarkly",
                    key, old_version = existing.version(), new_version = item.version();
                    "ignoring out-of-order update");
                false
            }
            _ => {
                items.insert(key.to_owned(), item);
                true
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let inner = self.inner.read().expect("data store lock poisoned");
        match inner.items(kind).get(key) {
            Some(item) if !item.is_tombstone() => Some(item.clone()),
            _ => None,
        }
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let inner = self.inner.read().expect("data store lock poisoned");
        inner
            .items(kind)
            .iter()
            .filter(|(_, item)| !item.is_tombstone())
            .map(|(k, item)| (k.clone(), item.clone()))
            .collect()
    }

    fn is_initialized(&self) -> bool {
        self.inner.read().expect("data store lock poisoned").initialized
    }
}
