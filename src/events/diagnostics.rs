//! Periodic diagnostic events: SDK and platform identification, a digest of the configuration,
//! and counters accumulated since the last diagnostic event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;

use super::current_time_millis;

/// Collects diagnostic counters from the other subsystems (stream reconnects, dropped and
/// deduplicated events) and renders the init and periodic diagnostic event bodies.
pub struct DiagnosticAccumulator {
    id: Value,
    data_since: AtomicU64,
    state: Mutex<DiagnosticCounters>,
}

#[derive(Default)]
struct DiagnosticCounters {
    stream_inits: Vec<Value>,
    events_in_last_batch: u64,
}

impl DiagnosticAccumulator {
    pub fn new(sdk_key: &str) -> Self {
        let suffix: String = sdk_key
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        DiagnosticAccumulator {
            id: json!({
                "diagnosticId": Uuid::new_v4().to_string(),
                "sdkKeySuffix": suffix,
            }),
            data_since: AtomicU64::new(current_time_millis()),
            state: Mutex::new(DiagnosticCounters::default()),
        }
    }

    pub fn record_stream_init(&self, duration: Duration, failed: bool) {
        let mut state = self.state.lock().unwrap();
        state.stream_inits.push(json!({
            "timestamp": current_time_millis(),
            "durationMillis": duration.as_millis() as u64,
            "failed": failed,
        }));
    }

    pub fn record_events_in_batch(&self, count: u64) {
        self.state.lock().unwrap().events_in_last_batch = count;
    }

    pub fn create_init_event(&self, config: &Config) -> Value {
        json!({
            "kind": "diagnostic-init",
            "creationDate": self.data_since.load(Ordering::SeqCst),
            "id": self.id,
            "configuration": configuration_digest(config),
            "sdk": {
                "name": config.sdk_metadata.name,
                "version": config.sdk_metadata.version,
            },
            "platform": {
                "name": "rust",
                "osName": std::env::consts::OS,
                "osArch": std::env::consts::ARCH,
            },
        })
    }

    pub fn create_stats_event_and_reset(
        &self,
        dropped_events: u64,
        deduplicated_contexts: u64,
    ) -> Value {
        let (stream_inits, events_in_last_batch) = {
            let mut state = self.state.lock().unwrap();
            (
                std::mem::take(&mut state.stream_inits),
                std::mem::replace(&mut state.events_in_last_batch, 0),
            )
        };
        let now = current_time_millis();
        let data_since = self.data_since.swap(now, Ordering::SeqCst);
        json!({
            "kind": "diagnostic",
            "creationDate": now,
            "id": self.id,
            "dataSinceDate": data_since,
            "droppedEvents": dropped_events,
            "deduplicatedUsers": deduplicated_contexts,
            "eventsInLastBatch": events_in_last_batch,
            "streamInits": stream_inits,
        })
    }
}

fn configuration_digest(config: &Config) -> Value {
    json!({
        "customBaseURI": config.base_uri != crate::config::DEFAULT_BASE_URI,
        "customStreamURI": config.stream_uri != crate::config::DEFAULT_STREAM_URI,
        "customEventsURI": config.events_uri != crate::config::DEFAULT_EVENTS_URI,
        "eventsCapacity": config.events_capacity,
        "connectTimeoutMillis": config.connect_timeout.as_millis() as u64,
        "socketTimeoutMillis": config.read_timeout.as_millis() as u64,
        "eventsFlushIntervalMillis": config.flush_interval.as_millis() as u64,
        "pollingIntervalMillis": config.poll_interval.as_millis() as u64,
        "streamingDisabled": !config.stream,
        "allAttributesPrivate": config.all_attributes_private,
        "userKeysCapacity": config.context_keys_capacity,
        "userKeysFlushIntervalMillis": config.context_keys_flush_interval.as_millis() as u64,
        "diagnosticRecordingIntervalMillis": config.diagnostic_recording_interval.as_millis() as u64,
    })
}
