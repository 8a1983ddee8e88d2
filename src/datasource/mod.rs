//! Data sources: replicators that keep the data store in sync with the flag delivery service.
//!
//! Two variants share one contract: [`StreamingDataSource`] holds a server-sent-events
//! connection open and applies incremental updates; [`PollingDataSource`] fetches the full
//! snapshot on a fixed interval. Both write through a [`DataSourceUpdateSink`], which owns
//! status reporting and flag-change notification.

pub mod polling;
pub mod sse;
pub mod status;
pub mod streaming;

mod retry;

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::dependency_tracker::{DependencyTracker, KindAndKey};
use crate::flag_tracker::FlagChangeEvent;
use crate::store::{AllData, DataKind, DataStore, StoreItem};
use crate::Listeners;

use status::{DataSourceErrorInfo, DataSourceState, DataSourceStatusProvider};

/// The common contract for data sources.
pub trait DataSource: Send + Sync {
    /// Block until the initial data load has completed or an unrecoverable error has occurred,
    /// up to `timeout`. Returns whether the source is initialized.
    fn wait_for_initialization(&self, timeout: Duration) -> bool;

    /// Whether the initial data load has completed.
    fn is_initialized(&self) -> bool;

    /// Signal the background thread to stop. Does not block waiting for it.
    fn stop(&self);
}

/// HTTP statuses from which the data source must not retry.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    !matches!(status, 401 | 403 | 404 | 410)
}

// Fires once: either the initial data has loaded (true) or the source has permanently given up
// (false). Threads waiting on start block here.
pub(crate) struct ReadySignal {
    state: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        ReadySignal {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(success);
            self.condvar.notify_all();
        }
    }

    pub fn is_signaled_ok(&self) -> bool {
        *self.state.lock().unwrap() == Some(true)
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |state| state.is_none())
            .unwrap();
        (*state).unwrap_or(false)
    }
}

/// The streaming protocol's `put` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct PutData {
    pub data: AllData,
}

/// The streaming protocol's `patch` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct PatchData {
    pub path: String,
    pub data: Value,
}

/// The streaming protocol's `delete` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct DeleteData {
    pub path: String,
    pub version: u64,
}

/// Split a stream path like `/flags/my-flag` into its kind and key.
pub(crate) fn parse_stream_path(path: &str) -> Option<(DataKind, &str)> {
    for kind in [DataKind::Flags, DataKind::Segments] {
        if let Some(key) = path.strip_prefix(kind.stream_path_prefix()) {
            return Some((kind, key));
        }
    }
    None
}

/// The single write path from data sources into the store.
///
/// Wrapping every store write here gives one place to turn store failures into status changes,
/// to maintain the dependency graph, and to publish flag-change events.
pub struct DataSourceUpdateSink {
    store: Arc<dyn DataStore>,
    status: Arc<DataSourceStatusProvider>,
    flag_change_listeners: Arc<Listeners<FlagChangeEvent>>,
    dependencies: Mutex<DependencyTracker>,
}

impl DataSourceUpdateSink {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        DataSourceUpdateSink {
            store,
            status: Arc::new(DataSourceStatusProvider::new()),
            flag_change_listeners: Arc::new(Listeners::new()),
            dependencies: Mutex::new(DependencyTracker::new()),
        }
    }

    pub fn status_provider(&self) -> &Arc<DataSourceStatusProvider> {
        &self.status
    }

    pub(crate) fn flag_change_listeners(&self) -> &Arc<Listeners<FlagChangeEvent>> {
        &self.flag_change_listeners
    }

    pub(crate) fn init(&self, all_data: AllData) {
        let affected = self.keys_changed_by_snapshot(&all_data);
        self.store.init(all_data);

        {
            let mut dependencies = self.dependencies.lock().unwrap();
            dependencies.reset();
            for kind in [DataKind::Flags, DataKind::Segments] {
                for (key, item) in self.store.all(kind) {
                    dependencies.update_dependencies_from(kind, &key, &item);
                }
            }
        }
        self.notify_affected(affected);
    }

    pub(crate) fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) {
        if !self.store.upsert(kind, key, item.clone()) {
            return;
        }
        let affected = {
            let mut dependencies = self.dependencies.lock().unwrap();
            dependencies.update_dependencies_from(kind, key, &item);
            let mut affected = HashSet::new();
            dependencies.add_affected_items(
                &mut affected,
                &KindAndKey {
                    kind,
                    key: key.to_owned(),
                },
            );
            affected
        };
        self.notify_affected(affected);
    }

    pub(crate) fn update_status(
        &self,
        state: DataSourceState,
        error: Option<DataSourceErrorInfo>,
    ) {
        self.status.update(state, error);
    }

    // Diff the incoming snapshot against current store contents, returning the closure of every
    // item whose evaluation could change. Computed against the union of both dependency graphs
    // (old items may depend on things the new snapshot drops).
    fn keys_changed_by_snapshot(&self, new_data: &AllData) -> HashSet<KindAndKey> {
        if self.flag_change_listeners.is_empty() {
            return HashSet::new();
        }
        let mut changed = HashSet::new();
        let old_flags = self.store.all(DataKind::Flags);
        let old_segments = self.store.all(DataKind::Segments);

        for (key, old) in &old_flags {
            match new_data.flags.get(key) {
                Some(new) if old.as_flag().map(AsRef::as_ref) == Some(new) => {}
                _ => {
                    changed.insert(KindAndKey {
                        kind: DataKind::Flags,
                        key: key.clone(),
                    });
                }
            }
        }
        for key in new_data.flags.keys() {
            if !old_flags.contains_key(key) {
                changed.insert(KindAndKey {
                    kind: DataKind::Flags,
                    key: key.clone(),
                });
            }
        }
        for (key, old) in &old_segments {
            match new_data.segments.get(key) {
                Some(new) if old.as_segment().map(AsRef::as_ref) == Some(new) => {}
                _ => {
                    changed.insert(KindAndKey {
                        kind: DataKind::Segments,
                        key: key.clone(),
                    });
                }
            }
        }
        for key in new_data.segments.keys() {
            if !old_segments.contains_key(key) {
                changed.insert(KindAndKey {
                    kind: DataKind::Segments,
                    key: key.clone(),
                });
            }
        }

        let mut affected = HashSet::new();
        let dependencies = self.dependencies.lock().unwrap();
        for item in &changed {
            dependencies.add_affected_items(&mut affected, item);
        }
        affected
    }

    fn notify_affected(&self, affected: HashSet<KindAndKey>) {
        for item in affected {
            if item.kind == DataKind::Flags {
                self.flag_change_listeners
                    .notify(&FlagChangeEvent { key: item.key });
            }
        }
    }
}
