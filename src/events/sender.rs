//! The event delivery thread: serializes payloads and POSTs them to the events endpoint.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;

use super::output::{EventOutputFormatter, OutputEvent};
use super::summarizer::EventSummary;

const BULK_PATH: &str = "/bulk";
const DIAGNOSTIC_PATH: &str = "/diagnostic";
const EVENT_SCHEMA_VERSION: &str = "4";
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) enum SenderMessage {
    Flush {
        events: Vec<OutputEvent>,
        summary: EventSummary,
    },
    Diagnostic(Value),
    Stop,
}

/// Handle to the delivery thread. The channel capacity of one is the "at most one buffered
/// flush" rule: a flush that arrives while another is queued stays in the outbox instead.
pub(crate) struct EventSender {
    pub tx: SyncSender<SenderMessage>,
    handle: Option<JoinHandle<()>>,
}

impl EventSender {
    pub fn start(
        config: Arc<Config>,
        formatter: EventOutputFormatter,
        disabled: Arc<AtomicBool>,
        last_known_server_time: Arc<AtomicU64>,
    ) -> EventSender {
        let (tx, rx) = sync_channel::<SenderMessage>(1);
        let worker = SenderWorker {
            config,
            formatter,
            disabled,
            last_known_server_time,
        };
        let handle = thread::Builder::new()
            .name("launchdarkly-event-sender".to_owned())
            .spawn(move || worker.run(rx))
            .ok();
        EventSender {
            tx,
            handle,
        }
    }

    /// Stop the delivery thread after it drains any queued payload.
    pub fn stop(&mut self) {
        let _ = self.tx.send(SenderMessage::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct SenderWorker {
    config: Arc<Config>,
    formatter: EventOutputFormatter,
    disabled: Arc<AtomicBool>,
    last_known_server_time: Arc<AtomicU64>,
}

impl SenderWorker {
    fn run(self, rx: Receiver<SenderMessage>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                log::error!(target: "launchdarkly", error:display;
                    "failed to start event sender runtime");
                return;
            }
        };
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .build()
            .expect("failed to construct HTTP client");

        while let Ok(message) = rx.recv() {
            match message {
                SenderMessage::Flush { events, summary } => {
                    if self.disabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    let count = events.len();
                    let output = self.formatter.make_output_events(&events, summary);
                    if output.is_empty() {
                        continue;
                    }
                    log::debug!(target: "launchdarkly", count; "delivering event payload");
                    runtime.block_on(self.post(
                        &client,
                        &format!("{}{}", self.config.events_uri, BULK_PATH),
                        &output,
                        true,
                    ));
                }
                SenderMessage::Diagnostic(event) => {
                    if self.disabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    runtime.block_on(self.post(
                        &client,
                        &format!("{}{}", self.config.events_uri, DIAGNOSTIC_PATH),
                        &event,
                        false,
                    ));
                }
                SenderMessage::Stop => return,
            }
        }
    }

    // One immediate retry on transient failure, then the payload is dropped. The payload ID is
    // generated once and reused on the retry so the service can deduplicate.
    async fn post<T: serde::Serialize>(
        &self,
        client: &reqwest::Client,
        uri: &str,
        body: &T,
        is_event_payload: bool,
    ) {
        let json = match serde_json::to_vec(body) {
            Ok(json) => json,
            Err(error) => {
                log::error!(target: "launchdarkly", error:display;
                    "failed to serialize event payload");
                return;
            }
        };
        let payload_id = Uuid::new_v4().to_string();

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let mut request = client
                .post(uri)
                .header("Authorization", &self.config.sdk_key)
                .header("Content-Type", "application/json")
                .header("User-Agent", self.config.user_agent());
            if is_event_payload {
                request = request
                    .header("X-LaunchDarkly-Event-Schema", EVENT_SCHEMA_VERSION)
                    .header("X-LaunchDarkly-Payload-ID", &payload_id);
            }
            request = match self.encode_body(&json) {
                Body::Plain => request.body(json.clone()),
                Body::Gzip(compressed) => request
                    .header("Content-Encoding", "gzip")
                    .body(compressed),
            };

            match request.send().await {
                Ok(response) => {
                    if let Some(server_time) = parse_server_date(&response) {
                        self.last_known_server_time
                            .store(server_time, Ordering::SeqCst);
                    }
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return;
                    }
                    if !is_recoverable_event_status(status) {
                        log::error!(target: "launchdarkly", status;
                            "received unrecoverable HTTP status posting events, no further events will be sent");
                        self.disabled.store(true, Ordering::SeqCst);
                        return;
                    }
                    log::warn!(target: "launchdarkly", status, attempt;
                        "error posting events, will retry");
                }
                Err(error) => {
                    log::warn!(target: "launchdarkly", error:display = error.without_url(), attempt;
                        "error posting events, will retry");
                }
            }
        }
        log::warn!(target: "launchdarkly", "dropping event payload after failed retry");
    }

    fn encode_body(&self, json: &[u8]) -> Body {
        if !self.config.compress_events {
            return Body::Plain;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(json).is_err() {
            return Body::Plain;
        }
        match encoder.finish() {
            Ok(compressed) => Body::Gzip(compressed),
            Err(_) => Body::Plain,
        }
    }
}

enum Body {
    Plain,
    Gzip(Vec<u8>),
}

fn is_recoverable_event_status(status: u16) -> bool {
    !matches!(status, 401 | 403 | 404 | 410)
}

fn parse_server_date(response: &reqwest::Response) -> Option<u64> {
    let date = response.headers().get("Date")?.to_str().ok()?;
    chrono::DateTime::parse_from_rfc2822(date)
        .ok()
        .map(|t| t.timestamp_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_statuses() {
        for status in [400, 408, 429, 500, 503] {
            assert!(is_recoverable_event_status(status), "{status}");
        }
        for status in [401, 403, 404, 410] {
            assert!(!is_recoverable_event_status(status), "{status}");
        }
    }
}
