//! Support for database-backed data stores.
//!
//! A database integration only implements [`PersistentDataStore`], which deals in opaque
//! serialized items; [`CachingStoreWrapper`] layers JSON (de)serialization, optional
//! time-bounded caching, availability monitoring, and the versioned-upsert contract on top, so
//! drivers stay schema-agnostic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::ExpiringCache;
use crate::Result;

use super::status::{DataStoreStatus, DataStoreStatusProvider};
use super::{AllData, DataKind, DataStore, StoreItem};

/// Marker key that persistent stores use to record that a full init has happened.
pub const INITED_KEY: &str = "$inited";

const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An item in the form persistent stores exchange: a version number (so the store can implement
/// the versioned upsert without understanding the data) plus opaque JSON bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItem {
    pub version: u64,
    pub serialized: Vec<u8>,
}

/// The interface a database driver implements. All operations are keyed by
/// `(kind.namespace(), item key)`; versions must be compared with the driver's atomic
/// read-modify-write primitive.
pub trait PersistentDataStore: Send + Sync {
    /// Atomically replace all data and write the `$inited` marker.
    fn init_internal(&self, all_data: Vec<(DataKind, HashMap<String, SerializedItem>)>)
        -> Result<()>;

    fn get_internal(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>>;

    fn get_all_internal(&self, kind: DataKind) -> Result<HashMap<String, SerializedItem>>;

    /// Store the item unless an existing item under this key has an equal or higher version.
    /// Returns whether the write took effect.
    fn upsert_internal(&self, kind: DataKind, key: &str, item: SerializedItem) -> Result<bool>;

    fn initialized_internal(&self) -> Result<bool>;

    /// A cheap liveness probe, used to poll for recovery after a failure.
    fn is_available(&self) -> bool;
}

fn serialize_item(item: &StoreItem) -> SerializedItem {
    let json = match item {
        StoreItem::Flag(f) => serde_json::to_vec(f.as_ref()),
        StoreItem::Segment(s) => serde_json::to_vec(s.as_ref()),
        StoreItem::Tombstone(version) => {
            serde_json::to_vec(&serde_json::json!({"version": version, "deleted": true}))
        }
    };
    SerializedItem {
        version: item.version(),
        // Serializing our own model types cannot fail.
        serialized: json.expect("item serialization failed"),
    }
}

fn deserialize_item(kind: DataKind, item: &SerializedItem) -> serde_json::Result<StoreItem> {
    let value = serde_json::from_slice(&item.serialized)?;
    StoreItem::parse(kind, value)
}

/// A [`DataStore`] that delegates storage to a [`PersistentDataStore`] driver.
pub struct CachingStoreWrapper {
    core: Arc<dyn PersistentDataStore>,
    cache_ttl: Option<Duration>,
    item_cache: Mutex<ExpiringCache<(DataKind, String), Option<StoreItem>>>,
    all_cache: Mutex<ExpiringCache<DataKind, HashMap<String, StoreItem>>>,
    initialized: AtomicBool,
    inited_check: Mutex<Option<(Instant, bool)>>,
    status: Arc<DataStoreStatusProvider>,
    poll_active: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl CachingStoreWrapper {
    /// Wrap a driver. `cache_ttl` of `None` disables caching; all reads go to the driver.
    pub fn new(core: Arc<dyn PersistentDataStore>, cache_ttl: Option<Duration>) -> Self {
        let capacity = 1000;
        CachingStoreWrapper {
            core,
            cache_ttl,
            item_cache: Mutex::new(ExpiringCache::new(
                capacity,
                cache_ttl.unwrap_or(Duration::ZERO),
            )),
            all_cache: Mutex::new(ExpiringCache::new(
                DataKind::ALL.len(),
                cache_ttl.unwrap_or(Duration::ZERO),
            )),
            initialized: AtomicBool::new(false),
            inited_check: Mutex::new(None),
            status: Arc::new(DataStoreStatusProvider::new()),
            poll_active: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status_provider(&self) -> &Arc<DataStoreStatusProvider> {
        &self.status
    }

    fn caching(&self) -> bool {
        self.cache_ttl.is_some()
    }

    // Driver failures are never surfaced to the caller: they are logged, the status flips to
    // unavailable, and a recovery poll starts.
    fn on_store_error(&self, operation: &str, error: &crate::Error) {
        log::warn!(target: "launchdarkly", operation, error:display;
            "persistent data store operation failed");
        self.status.update(DataStoreStatus {
            available: false,
            needs_refresh: false,
        });
        if self.poll_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(&self.core);
        let status = Arc::clone(&self.status);
        let poll_active = Arc::clone(&self.poll_active);
        let stop = Arc::clone(&self.stop);
        let spawned = thread::Builder::new()
            .name("launchdarkly-store-monitor".to_owned())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if core.is_available() {
                        log::info!(target: "launchdarkly", "persistent data store is available again");
                        status.update(DataStoreStatus {
                            available: true,
                            needs_refresh: true,
                        });
                        break;
                    }
                    thread::sleep(AVAILABILITY_POLL_INTERVAL);
                }
                poll_active.store(false, Ordering::SeqCst);
            });
        if spawned.is_err() {
            self.poll_active.store(false, Ordering::SeqCst);
        }
    }
}

impl DataStore for CachingStoreWrapper {
    fn init(&self, all_data: AllData) {
        let mut parsed: Vec<(DataKind, HashMap<String, StoreItem>)> = vec![
            (
                DataKind::Segments,
                all_data
                    .segments
                    .into_iter()
                    .map(|(k, s)| (k, StoreItem::Segment(Arc::new(s))))
                    .collect(),
            ),
            (
                DataKind::Flags,
                all_data
                    .flags
                    .into_iter()
                    .map(|(k, f)| (k, StoreItem::Flag(Arc::new(f))))
                    .collect(),
            ),
        ];

        let serialized = parsed
            .iter()
            .map(|(kind, items)| {
                (
                    *kind,
                    items
                        .iter()
                        .map(|(k, item)| (k.clone(), serialize_item(item)))
                        .collect(),
                )
            })
            .collect();

        if let Err(error) = self.core.init_internal(serialized) {
            self.on_store_error("init", &error);
            return;
        }

        if self.caching() {
            let mut item_cache = self.item_cache.lock().unwrap();
            let mut all_cache = self.all_cache.lock().unwrap();
            item_cache.clear();
            all_cache.clear();
            for (kind, items) in parsed.drain(..) {
                for (key, item) in &items {
                    item_cache.insert((kind, key.clone()), Some(item.clone()));
                }
                all_cache.insert(kind, items);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> bool {
        let serialized = serialize_item(&item);
        let updated = match self.core.upsert_internal(kind, key, serialized) {
            Ok(updated) => updated,
            Err(error) => {
                self.on_store_error("upsert", &error);
                return false;
            }
        };
        if self.caching() {
            if updated {
                self.item_cache
                    .lock()
                    .unwrap()
                    .insert((kind, key.to_owned()), Some(item));
            }
            // The all-items snapshot is stale either way; recompute lazily.
            self.all_cache.lock().unwrap().remove(&kind);
        }
        updated
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        if self.caching() {
            // Negative results are cached too, hence the nested Option.
            if let Some(cached) = self.item_cache.lock().unwrap().get(&(kind, key.to_owned())) {
                return cached.filter(|item| !item.is_tombstone());
            }
        }
        let item = match self.core.get_internal(kind, key) {
            Ok(serialized) => serialized.and_then(|s| match deserialize_item(kind, &s) {
                Ok(item) => Some(item),
                Err(error) => {
                    log::error!(target: "launchdarkly", kind:debug, key, error:display;
                        "failed to deserialize item from persistent store");
                    None
                }
            }),
            Err(error) => {
                self.on_store_error("get", &error);
                return None;
            }
        };
        if self.caching() {
            self.item_cache
                .lock()
                .unwrap()
                .insert((kind, key.to_owned()), item.clone());
        }
        item.filter(|item| !item.is_tombstone())
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if self.caching() {
            if let Some(cached) = self.all_cache.lock().unwrap().get(&kind) {
                return live_items(&cached);
            }
        }
        let items = match self.core.get_all_internal(kind) {
            Ok(serialized) => serialized
                .into_iter()
                .filter_map(|(key, s)| match deserialize_item(kind, &s) {
                    Ok(item) => Some((key, item)),
                    Err(error) => {
                        log::error!(target: "launchdarkly", kind:debug, key, error:display;
                            "failed to deserialize item from persistent store");
                        None
                    }
                })
                .collect(),
            Err(error) => {
                self.on_store_error("all", &error);
                return HashMap::new();
            }
        };
        if self.caching() {
            self.all_cache.lock().unwrap().insert(kind, items);
            return live_items(&self.all_cache.lock().unwrap().get(&kind).unwrap_or_default());
        }
        live_items(&items)
    }

    fn is_initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        // The inited flag can only transition to true, so a cached false is re-checked at most
        // once per cache interval.
        if let Some(ttl) = self.cache_ttl {
            let mut check = self.inited_check.lock().unwrap();
            if let Some((at, result)) = *check {
                if at.elapsed() < ttl {
                    return result;
                }
            }
            let result = self.core.initialized_internal().unwrap_or(false);
            *check = Some((Instant::now(), result));
            if result {
                self.initialized.store(true, Ordering::SeqCst);
            }
            return result;
        }
        let result = self.core.initialized_internal().unwrap_or(false);
        if result {
            self.initialized.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Stop background availability monitoring. Further operations still pass through to the
    /// driver.
    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn live_items(items: &HashMap<String, StoreItem>) -> HashMap<String, StoreItem> {
    items
        .iter()
        .filter(|(_, item)| !item.is_tombstone())
        .map(|(k, item)| (k.clone(), item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use crate::Error;

    use super::*;

    /// A driver backed by plain maps, with a switch to simulate an outage.
    #[derive(Default)]
    struct FakeDriver {
        data: Mutex<HashMap<(DataKind, String), SerializedItem>>,
        inited: AtomicBool,
        failing: AtomicBool,
        queries: AtomicUsize,
    }

    impl FakeDriver {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(Error::DataStore("simulated outage".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    impl PersistentDataStore for FakeDriver {
        fn init_internal(
            &self,
            all_data: Vec<(DataKind, HashMap<String, SerializedItem>)>,
        ) -> Result<()> {
            self.check()?;
            let mut data = self.data.lock().unwrap();
            data.clear();
            for (kind, items) in all_data {
                for (key, item) in items {
                    data.insert((kind, key), item);
                }
            }
            self.inited.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn get_internal(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>> {
            self.check()?;
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.lock().unwrap().get(&(kind, key.to_owned())).cloned())
        }

        fn get_all_internal(&self, kind: DataKind) -> Result<HashMap<String, SerializedItem>> {
            self.check()?;
            Ok(self
                .data
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), item)| (key.clone(), item.clone()))
                .collect())
        }

        fn upsert_internal(
            &self,
            kind: DataKind,
            key: &str,
            item: SerializedItem,
        ) -> Result<bool> {
            self.check()?;
            let mut data = self.data.lock().unwrap();
            let slot = (kind, key.to_owned());
            match data.get(&slot) {
                Some(existing) if existing.version >= item.version => Ok(false),
                _ => {
                    data.insert(slot, item);
                    Ok(true)
                }
            }
        }

        fn initialized_internal(&self) -> Result<bool> {
            self.check()?;
            Ok(self.inited.load(Ordering::SeqCst))
        }

        fn is_available(&self) -> bool {
            !self.failing.load(Ordering::SeqCst)
        }
    }

    fn flag_item(key: &str, version: u64) -> StoreItem {
        StoreItem::parse(DataKind::Flags, json!({"key": key, "version": version})).unwrap()
    }

    #[test]
    fn round_trips_items_through_the_driver() {
        let driver = Arc::new(FakeDriver::default());
        let wrapper = CachingStoreWrapper::new(driver, None);
        wrapper.upsert(DataKind::Flags, "f", flag_item("f", 1));
        let got = wrapper.get(DataKind::Flags, "f").unwrap();
        assert_eq!(got.as_flag().unwrap().key, "f");
    }

    #[test]
    fn versioned_upsert_through_driver() {
        let driver = Arc::new(FakeDriver::default());
        let wrapper = CachingStoreWrapper::new(driver, None);
        assert!(wrapper.upsert(DataKind::Flags, "f", flag_item("f", 2)));
        assert!(!wrapper.upsert(DataKind::Flags, "f", flag_item("f", 1)));
        assert_eq!(wrapper.get(DataKind::Flags, "f").unwrap().version(), 2);
    }

    #[test]
    fn cached_get_skips_the_driver() {
        let driver = Arc::new(FakeDriver::default());
        let wrapper = CachingStoreWrapper::new(Arc::clone(&driver) as _, Some(Duration::from_secs(30)));
        wrapper.upsert(DataKind::Flags, "f", flag_item("f", 1));
        wrapper.get(DataKind::Flags, "f");
        wrapper.get(DataKind::Flags, "f");
        assert_eq!(driver.queries.load(Ordering::SeqCst), 0, "all reads should hit the cache");
    }

    #[test]
    fn driver_failure_flips_status_and_recovers() {
        let driver = Arc::new(FakeDriver::default());
        let wrapper = CachingStoreWrapper::new(Arc::clone(&driver) as _, None);
        driver.failing.store(true, Ordering::SeqCst);
        assert!(wrapper.get(DataKind::Flags, "f").is_none());
        assert!(!wrapper.status_provider().status().available);

        driver.failing.store(false, Ordering::SeqCst);
        // The monitor polls every 500ms; give it a little headroom.
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if wrapper.status_provider().status().available {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let status = wrapper.status_provider().status();
        assert!(status.available);
        assert!(status.needs_refresh);
        wrapper.close();
    }

    #[test]
    fn init_marks_initialized() {
        let driver = Arc::new(FakeDriver::default());
        let wrapper = CachingStoreWrapper::new(driver, Some(Duration::from_secs(30)));
        assert!(!wrapper.is_initialized());
        wrapper.init(AllData::default());
        assert!(wrapper.is_initialized());
    }
}
