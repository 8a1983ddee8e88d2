//! Out-of-band membership lookups for "big" segments: segments whose membership list is too
//! large to replicate through the normal data source and is instead maintained in an external
//! store.
//!
//! The evaluator consults [`BigSegmentStoreManager`], which decorates a [`BigSegmentStore`]
//! driver with per-context caching and staleness tracking.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::ExpiringCache;
use crate::{Listeners, Result};

/// Membership of one context in big segments: segment reference (`"{key}.g{generation}"`) to
/// explicit inclusion (`true`) or exclusion (`false`). A reference that is absent from the map
/// means neither.
pub type Membership = HashMap<String, bool>;

/// Metadata reported by a Big Segment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// When the store was last written by the out-of-band synchronization process, in epoch
    /// milliseconds; `None` if the store has never been synced.
    pub last_up_to_date: Option<u64>,
}

/// The interface a Big Segment store driver implements. Queries are keyed by a hash of the
/// context key so that drivers never see raw keys.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    fn get_membership(&self, context_hash: &str) -> Result<Option<Membership>>;
}

/// Health of big segment data as observed on an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    NotConfigured,
    StoreError,
}

/// Availability/staleness of the Big Segment store, for the status listener API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// Configuration for the Big Segment bridge.
pub struct BigSegmentsConfig {
    pub store: Arc<dyn BigSegmentStore>,
    /// Maximum number of contexts whose membership is cached. Defaults to 1000.
    pub context_cache_size: usize,
    /// How long a cached membership is used before re-querying. Defaults to 5 seconds.
    pub context_cache_time: Duration,
    /// How often the store's metadata is polled for the status API. Defaults to 5 seconds.
    pub status_poll_interval: Duration,
    /// How far behind the store may be before evaluations are flagged stale. Defaults to
    /// 2 minutes.
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub fn new(store: Arc<dyn BigSegmentStore>) -> Self {
        BigSegmentsConfig {
            store,
            context_cache_size: 1000,
            context_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Decorates the Big Segment store with membership caching and status polling.
pub struct BigSegmentStoreManager {
    store: Arc<dyn BigSegmentStore>,
    stale_after: Duration,
    cache: Mutex<ExpiringCache<String, Arc<Membership>>>,
    last_status: RwLock<Option<BigSegmentStoreStatus>>,
    listeners: Arc<Listeners<BigSegmentStoreStatus>>,
    poll_stop: SyncSender<()>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

// Reused whenever a membership query returns no data; memberships are immutable once queried.
fn empty_membership() -> Arc<Membership> {
    Arc::new(HashMap::new())
}

impl BigSegmentStoreManager {
    pub fn new(config: BigSegmentsConfig) -> Arc<Self> {
        let (poll_stop, stop_receiver) = sync_channel::<()>(1);
        let manager = Arc::new(BigSegmentStoreManager {
            store: Arc::clone(&config.store),
            stale_after: config.stale_after,
            cache: Mutex::new(ExpiringCache::new(
                config.context_cache_size,
                config.context_cache_time,
            )),
            last_status: RwLock::new(None),
            listeners: Arc::new(Listeners::new()),
            poll_stop,
            poll_handle: Mutex::new(None),
        });

        let poll_interval = config.status_poll_interval;
        let handle = {
            let manager = Arc::clone(&manager);
            std::thread::Builder::new()
                .name("launchdarkly-big-segments-poll".to_owned())
                .spawn(move || loop {
                    manager.poll_store_and_update_status();
                    match stop_receiver.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                })
                .ok()
        };
        *manager.poll_handle.lock().unwrap() = handle;
        manager
    }

    pub fn stop(&self) {
        let _ = self.poll_stop.try_send(());
        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn status_listeners(&self) -> &Arc<Listeners<BigSegmentStoreStatus>> {
        &self.listeners
    }

    pub fn status(&self) -> BigSegmentStoreStatus {
        if let Some(status) = *self.last_status.read().unwrap() {
            return status;
        }
        self.poll_store_and_update_status()
    }

    /// Look up the membership for a context key, with caching. Returns the membership (possibly
    /// empty) and the status to surface on the evaluation.
    ///
    /// The query is by key alone: any given big segment applies to only one context kind, so a
    /// key shared across kinds is unambiguous in the membership data.
    pub fn get_context_membership(
        &self,
        context_key: &str,
    ) -> (Arc<Membership>, BigSegmentsStatus) {
        let cached = self.cache.lock().unwrap().get(&context_key.to_owned());
        let membership = match cached {
            Some(membership) => membership,
            None => {
                let hash = hash_for_context_key(context_key);
                match self.store.get_membership(&hash) {
                    Ok(membership) => {
                        let membership =
                            membership.map(Arc::new).unwrap_or_else(empty_membership);
                        self.cache
                            .lock()
                            .unwrap()
                            .insert(context_key.to_owned(), Arc::clone(&membership));
                        membership
                    }
                    Err(error) => {
                        log::error!(target: "launchdarkly", error:display;
                            "big segment store membership query returned error");
                        return (empty_membership(), BigSegmentsStatus::StoreError);
                    }
                }
            }
        };
        let status = self.status();
        if !status.available {
            return (membership, BigSegmentsStatus::StoreError);
        }
        let health = if status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        };
        (membership, health)
    }

    fn poll_store_and_update_status(&self) -> BigSegmentStoreStatus {
        let new_status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(error) => {
                log::error!(target: "launchdarkly", error:display;
                    "big segment store status query returned error");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        let previous = {
            let mut last = self.last_status.write().unwrap();
            last.replace(new_status)
        };
        if previous != Some(new_status) {
            self.listeners.notify(&new_status);
        }
        new_status
    }

    fn is_stale(&self, last_up_to_date: Option<u64>) -> bool {
        let Some(timestamp) = last_up_to_date else {
            return true;
        };
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        now_ms.saturating_sub(timestamp) >= self.stale_after.as_millis() as u64
    }
}

fn hash_for_context_key(context_key: &str) -> String {
    BASE64.encode(Sha256::digest(context_key.as_bytes()))
}
