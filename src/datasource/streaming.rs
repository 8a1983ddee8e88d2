//! The default data source: a persistent server-sent-events connection with automatic
//! reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::StatusCode;

use crate::config::Config;
use crate::events::diagnostics::DiagnosticAccumulator;
use crate::store::StoreItem;

use super::retry::RetryDelay;
use super::sse::SseDecoder;
use super::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use super::{
    is_http_error_recoverable, parse_stream_path, DataSource, DataSourceUpdateSink, DeleteData,
    PatchData, PutData, ReadySignal,
};

// Heartbeat comments keep an idle stream alive well within this window.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const STREAM_ALL_PATH: &str = "/all";

enum StreamFailure {
    Unrecoverable(u16),
    Recoverable(DataSourceErrorInfo),
}

enum StreamExit {
    Stopped,
    Failed(StreamFailure),
}

/// A [`DataSource`] that applies `put`/`patch`/`delete` events from the streaming endpoint.
///
/// Reconnects with exponential backoff and jitter; the backoff resets to its base once a
/// connection has stayed up for a minute.
pub struct StreamingDataSource {
    ready: Arc<ReadySignal>,
    stop: Arc<AtomicBool>,
}

impl StreamingDataSource {
    pub fn start(
        config: Arc<Config>,
        sink: Arc<DataSourceUpdateSink>,
        diagnostics: Option<Arc<DiagnosticAccumulator>>,
    ) -> Arc<StreamingDataSource> {
        let ready = Arc::new(ReadySignal::new());
        let stop = Arc::new(AtomicBool::new(false));

        let source = Arc::new(StreamingDataSource {
            ready: Arc::clone(&ready),
            stop: Arc::clone(&stop),
        });

        let worker = StreamWorker {
            config,
            sink,
            diagnostics,
            ready: Arc::clone(&ready),
            stop,
        };
        // The thread exits on its own when stop is signaled; shutdown does not join it.
        if thread::Builder::new()
            .name("launchdarkly-streaming".to_owned())
            .spawn(move || worker.run())
            .is_err()
        {
            log::error!(target: "launchdarkly", "failed to start streaming thread");
            ready.signal(false);
        }
        source
    }
}

impl DataSource for StreamingDataSource {
    fn wait_for_initialization(&self, timeout: Duration) -> bool {
        self.ready.wait(timeout)
    }

    fn is_initialized(&self) -> bool {
        self.ready.is_signaled_ok()
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct StreamWorker {
    config: Arc<Config>,
    sink: Arc<DataSourceUpdateSink>,
    diagnostics: Option<Arc<DiagnosticAccumulator>>,
    ready: Arc<ReadySignal>,
    stop: Arc<AtomicBool>,
}

impl StreamWorker {
    fn run(self) {
        let uri = match self.stream_uri() {
            Ok(uri) => uri,
            Err(error) => {
                log::error!(target: "launchdarkly", error:display; "invalid stream URI");
                self.give_up(None, error.to_string());
                return;
            }
        };
        log::info!(target: "launchdarkly", uri = uri.as_str(); "connecting to stream");

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                self.give_up(None, format!("failed to start stream runtime: {error}"));
                return;
            }
        };

        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .build()
            .expect("failed to construct HTTP client");

        let mut retry = RetryDelay::new(self.config.initial_reconnect_delay);
        let mut first_attempt = true;
        while !self.stopped() {
            if !first_attempt {
                let delay = retry.next_delay(Instant::now());
                log::info!(target: "launchdarkly", delay:debug; "will reconnect stream after delay");
                if !self.sleep_unless_stopped(delay) {
                    return;
                }
            }
            first_attempt = false;

            let connect_started = Instant::now();
            let (exit, received_events) =
                runtime.block_on(self.read_stream(&client, &uri, &mut retry, connect_started));
            // A failed init is a connection that never produced an event.
            if matches!(exit, StreamExit::Failed(_)) && !received_events {
                self.record_stream_init(connect_started, true);
            }
            match exit {
                StreamExit::Stopped => return,
                StreamExit::Failed(StreamFailure::Unrecoverable(status)) => {
                    log::error!(target: "launchdarkly", status;
                        "received unrecoverable HTTP status from stream connection, giving up");
                    self.give_up(Some(status), format!("HTTP error {status}"));
                    return;
                }
                StreamExit::Failed(StreamFailure::Recoverable(error)) => {
                    log::warn!(target: "launchdarkly", message = error.message.as_str();
                        "stream connection failed, will retry");
                    self.sink
                        .update_status(DataSourceState::Interrupted, Some(error));
                }
            }
        }
    }

    fn stream_uri(&self) -> Result<url::Url, url::ParseError> {
        let mut uri = url::Url::parse(&format!("{}{}", self.config.stream_uri, STREAM_ALL_PATH))?;
        if let Some(filter) = &self.config.payload_filter_key {
            uri.query_pairs_mut().append_pair("filter", filter);
        }
        Ok(uri)
    }

    async fn read_stream(
        &self,
        client: &reqwest::Client,
        uri: &url::Url,
        retry: &mut RetryDelay,
        connect_started: Instant,
    ) -> (StreamExit, bool) {
        let network_failure = |message: String| {
            StreamExit::Failed(StreamFailure::Recoverable(DataSourceErrorInfo::new(
                DataSourceErrorKind::NetworkError,
                None,
                message,
            )))
        };

        let mut request = client
            .get(uri.clone())
            .header("Authorization", &self.config.sdk_key)
            .header("User-Agent", self.config.user_agent())
            .header("Accept", "text/event-stream");
        if let Some(tags) = self.config.tag_header_value() {
            request = request.header("X-LaunchDarkly-Tags", tags);
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return (
                    network_failure(error.without_url().to_string()),
                    false,
                );
            }
        };
        let status = response.status();
        if !status.is_success() {
            return (StreamExit::Failed(self.classify_status(status)), false);
        }

        let mut decoder = SseDecoder::new();
        let mut received_events = false;
        loop {
            if self.stopped() {
                return (StreamExit::Stopped, received_events);
            }
            let chunk = match tokio::time::timeout(STREAM_READ_TIMEOUT, response.chunk()).await {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(error)) => {
                    return (
                        network_failure(error.without_url().to_string()),
                        received_events,
                    );
                }
                Err(_elapsed) => {
                    return (
                        network_failure("stream read timed out".to_owned()),
                        received_events,
                    );
                }
            };
            let Some(chunk) = chunk else {
                return (
                    network_failure("stream connection closed by server".to_owned()),
                    received_events,
                );
            };
            for event in decoder.decode(&chunk) {
                retry.set_good_since(Instant::now());
                if !received_events {
                    received_events = true;
                    self.record_stream_init(connect_started, false);
                }
                if let Err(error) = self.process_event(&event.name, &event.data) {
                    return (
                        StreamExit::Failed(StreamFailure::Recoverable(error)),
                        received_events,
                    );
                }
            }
        }
    }

    fn classify_status(&self, status: StatusCode) -> StreamFailure {
        let code = status.as_u16();
        if is_http_error_recoverable(code) {
            StreamFailure::Recoverable(DataSourceErrorInfo::new(
                DataSourceErrorKind::ErrorResponse,
                Some(code),
                format!("HTTP error {code} on stream connection"),
            ))
        } else {
            StreamFailure::Unrecoverable(code)
        }
    }

    fn process_event(&self, name: &str, data: &str) -> Result<(), DataSourceErrorInfo> {
        let invalid = |error: serde_json::Error| {
            DataSourceErrorInfo::new(
                DataSourceErrorKind::InvalidData,
                None,
                format!("malformed {name} event: {error}"),
            )
        };
        match name {
            "put" => {
                let put: PutData = serde_json::from_str(data).map_err(invalid)?;
                log::debug!(target: "launchdarkly",
                    flags = put.data.flags.len(), segments = put.data.segments.len();
                    "received put event");
                self.sink.init(put.data);
                self.sink.update_status(DataSourceState::Valid, None);
                self.ready.signal(true);
            }
            "patch" => {
                let patch: PatchData = serde_json::from_str(data).map_err(invalid)?;
                match parse_stream_path(&patch.path) {
                    Some((kind, key)) => {
                        let item = StoreItem::parse(kind, patch.data).map_err(invalid)?;
                        log::debug!(target: "launchdarkly",
                            path = patch.path.as_str(), version = item.version();
                            "received patch event");
                        self.sink.upsert(kind, key, item);
                        self.sink.update_status(DataSourceState::Valid, None);
                    }
                    None => {
                        log::warn!(target: "launchdarkly", path = patch.path.as_str();
                            "patch for unknown path");
                    }
                }
            }
            "delete" => {
                let delete: DeleteData = serde_json::from_str(data).map_err(invalid)?;
                match parse_stream_path(&delete.path) {
                    Some((kind, key)) => {
                        log::debug!(target: "launchdarkly",
                            path = delete.path.as_str(), version = delete.version;
                            "received delete event");
                        self.sink
                            .upsert(kind, key, StoreItem::Tombstone(delete.version));
                        self.sink.update_status(DataSourceState::Valid, None);
                    }
                    None => {
                        log::warn!(target: "launchdarkly", path = delete.path.as_str();
                            "delete for unknown path");
                    }
                }
            }
            other => {
                log::warn!(target: "launchdarkly", event = other; "unhandled event in stream");
            }
        }
        Ok(())
    }

    fn give_up(&self, status_code: Option<u16>, message: String) {
        self.sink.update_status(
            DataSourceState::Off,
            Some(DataSourceErrorInfo::new(
                DataSourceErrorKind::ErrorResponse,
                status_code,
                message,
            )),
        );
        // If a caller is waiting on initialization, stop the wait; this has no effect if the
        // source already initialized.
        self.ready.signal(false);
    }

    fn record_stream_init(&self, started: Instant, failed: bool) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_stream_init(started.elapsed(), failed);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // Returns false if stopped while sleeping.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }
}
