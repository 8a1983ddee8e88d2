//! Observable status for the data store.

use std::sync::{Arc, RwLock};

use crate::Listeners;

/// The availability of the data store, as observed by the caching wrapper around a persistent
/// store. The in-memory store is always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// Whether the store is reachable.
    pub available: bool,
    /// True after the store has recovered from an outage during which writes may have been
    /// lost; the data source should re-request a full snapshot.
    pub needs_refresh: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        DataStoreStatus {
            available: true,
            needs_refresh: false,
        }
    }
}

/// Holds the current [`DataStoreStatus`] and notifies registered listeners when it changes.
pub struct DataStoreStatusProvider {
    status: RwLock<DataStoreStatus>,
    listeners: Arc<Listeners<DataStoreStatus>>,
}

impl Default for DataStoreStatusProvider {
    fn default() -> Self {
        DataStoreStatusProvider {
            status: RwLock::new(DataStoreStatus::default()),
            listeners: Arc::new(Listeners::new()),
        }
    }
}

impl DataStoreStatusProvider {
    pub fn new() -> Self {
        DataStoreStatusProvider::default()
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.status.read().expect("status lock poisoned")
    }

    pub fn listeners(&self) -> &Arc<Listeners<DataStoreStatus>> {
        &self.listeners
    }

    pub(crate) fn update(&self, new_status: DataStoreStatus) {
        {
            let mut status = self.status.write().expect("status lock poisoned");
            if *status == new_status {
                return;
            }
            *status = new_status;
        }
        self.listeners.notify(&new_status);
    }
}
