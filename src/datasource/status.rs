//! Observable status for the data source.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::Listeners;

/// The overall state of the data source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    /// Still establishing the initial connection or waiting for the first data load.
    Initializing,
    /// Connected and receiving data.
    Valid,
    /// Temporarily disconnected; the SDK is retrying and serving the last known data.
    Interrupted,
    /// Permanently stopped, either by an unrecoverable error or by shutdown.
    Off,
}

/// Classification of a data source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    Unknown,
    NetworkError,
    /// The service returned an unexpected HTTP status.
    ErrorResponse,
    /// A payload could not be parsed.
    InvalidData,
    /// A data store write failed.
    StoreError,
}

/// Details of the most recent data source failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceErrorInfo {
    pub kind: DataSourceErrorKind,
    pub status_code: Option<u16>,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl DataSourceErrorInfo {
    pub(crate) fn new(
        kind: DataSourceErrorKind,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        DataSourceErrorInfo {
            kind,
            status_code,
            time: Utc::now(),
            message: message.into(),
        }
    }
}

/// A snapshot of data source health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the state last changed.
    pub since: DateTime<Utc>,
    pub last_error: Option<DataSourceErrorInfo>,
}

/// Holds the current [`DataSourceStatus`] and notifies listeners of changes.
pub struct DataSourceStatusProvider {
    status: RwLock<DataSourceStatus>,
    listeners: Arc<Listeners<DataSourceStatus>>,
}

impl Default for DataSourceStatusProvider {
    fn default() -> Self {
        DataSourceStatusProvider {
            status: RwLock::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                since: Utc::now(),
                last_error: None,
            }),
            listeners: Arc::new(Listeners::new()),
        }
    }
}

impl DataSourceStatusProvider {
    pub fn new() -> Self {
        DataSourceStatusProvider::default()
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.read().expect("status lock poisoned").clone()
    }

    pub fn listeners(&self) -> &Arc<Listeners<DataSourceStatus>> {
        &self.listeners
    }

    pub(crate) fn update(
        &self,
        mut new_state: DataSourceState,
        new_error: Option<DataSourceErrorInfo>,
    ) {
        let broadcast = {
            let mut status = self.status.write().expect("status lock poisoned");

            // A dropped connection during startup is still "initializing" from the caller's
            // point of view; there was never a valid connection to interrupt.
            if new_state == DataSourceState::Interrupted
                && status.state == DataSourceState::Initializing
            {
                new_state = DataSourceState::Initializing;
            }

            if new_state == status.state && new_error.is_none() {
                return;
            }

            *status = DataSourceStatus {
                since: if new_state == status.state {
                    status.since
                } else {
                    Utc::now()
                },
                last_error: new_error.or_else(|| status.last_error.clone()),
                state: new_state,
            };
            status.clone()
        };
        self.listeners.notify(&broadcast);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initializing() {
        let provider = DataSourceStatusProvider::new();
        assert_eq!(provider.status().state, DataSourceState::Initializing);
    }

    #[test]
    fn interrupted_before_valid_stays_initializing() {
        let provider = DataSourceStatusProvider::new();
        provider.update(
            DataSourceState::Interrupted,
            Some(DataSourceErrorInfo::new(
                DataSourceErrorKind::NetworkError,
                None,
                "connection refused",
            )),
        );
        let status = provider.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert!(status.last_error.is_some());
    }

    #[test]
    fn interrupted_after_valid_is_reported() {
        let provider = DataSourceStatusProvider::new();
        provider.update(DataSourceState::Valid, None);
        provider.update(
            DataSourceState::Interrupted,
            Some(DataSourceErrorInfo::new(
                DataSourceErrorKind::ErrorResponse,
                Some(503),
                "service unavailable",
            )),
        );
        let status = provider.status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.last_error.unwrap().status_code, Some(503));
    }

    #[test]
    fn same_state_without_error_is_a_no_op() {
        let provider = DataSourceStatusProvider::new();
        provider.update(DataSourceState::Valid, None);
        let since = provider.status().since;
        provider.update(DataSourceState::Valid, None);
        assert_eq!(provider.status().since, since);
    }
}
