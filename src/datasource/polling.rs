//! The polling data source: fetches the full flag/segment snapshot at a fixed interval.
//!
//! Used when streaming is disabled. The interval has a 30-second service floor, enforced by the
//! configuration; a small random jitter is subtracted from each wait so that many server
//! instances do not poll in lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::{thread_rng, Rng};
use reqwest::StatusCode;

use crate::config::Config;
use crate::store::AllData;

use super::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use super::{is_http_error_recoverable, DataSource, DataSourceUpdateSink, ReadySignal};

const LATEST_ALL_PATH: &str = "/sdk/latest-all";

const POLL_JITTER: Duration = Duration::from_secs(3);

/// A [`DataSource`] that replaces the store contents from the polling endpoint on every tick.
pub struct PollingDataSource {
    ready: Arc<ReadySignal>,
    stop: Arc<AtomicBool>,
    stop_sender: SyncSender<()>,
}

impl PollingDataSource {
    pub fn start(config: Arc<Config>, sink: Arc<DataSourceUpdateSink>) -> Arc<PollingDataSource> {
        let ready = Arc::new(ReadySignal::new());
        let stop = Arc::new(AtomicBool::new(false));
        // Buffer of one is enough: a full buffer means a stop command is already pending.
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);

        let source = Arc::new(PollingDataSource {
            ready: Arc::clone(&ready),
            stop: Arc::clone(&stop),
            stop_sender,
        });

        // The thread exits on its own when stopped; shutdown does not join it.
        let spawned = {
            let ready = Arc::clone(&ready);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("launchdarkly-polling".to_owned())
                .spawn(move || {
                    log::info!(target: "launchdarkly",
                        interval:debug = config.poll_interval;
                        "starting polling data source");

                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(error) => {
                            log::error!(target: "launchdarkly", error:display;
                                "failed to start polling runtime");
                            ready.signal(false);
                            return;
                        }
                    };
                    let requester = match FeatureRequester::new(&config) {
                        Ok(requester) => requester,
                        Err(error) => {
                            log::error!(target: "launchdarkly", error:display;
                                "invalid polling URI");
                            ready.signal(false);
                            return;
                        }
                    };

                    loop {
                        if stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let mut wait = jitter(config.poll_interval);
                        match runtime.block_on(requester.fetch()) {
                            Ok(all_data) => {
                                sink.init(all_data);
                                sink.update_status(DataSourceState::Valid, None);
                                ready.signal(true);
                            }
                            Err(PollError::Unrecoverable(status)) => {
                                log::error!(target: "launchdarkly", status;
                                    "received unrecoverable HTTP status from polling request, giving up");
                                sink.update_status(
                                    DataSourceState::Off,
                                    Some(DataSourceErrorInfo::new(
                                        DataSourceErrorKind::ErrorResponse,
                                        Some(status),
                                        format!("HTTP error {status}"),
                                    )),
                                );
                                ready.signal(false);
                                return;
                            }
                            Err(PollError::Recoverable { error, retry_after }) => {
                                log::warn!(target: "launchdarkly",
                                    message = error.message.as_str();
                                    "polling request failed, will retry");
                                sink.update_status(DataSourceState::Interrupted, Some(error));
                                if let Some(retry_after) = retry_after {
                                    wait = wait.max(retry_after);
                                }
                            }
                        }
                        match stop_receiver.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                })
        };
        if spawned.is_err() {
            log::error!(target: "launchdarkly", "failed to start polling thread");
            ready.signal(false);
        }
        source
    }
}

impl DataSource for PollingDataSource {
    fn wait_for_initialization(&self, timeout: Duration) -> bool {
        self.ready.wait(timeout)
    }

    fn is_initialized(&self) -> bool {
        self.ready.is_signaled_ok()
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.stop_sender.try_send(());
    }
}

enum PollError {
    Unrecoverable(u16),
    Recoverable {
        error: DataSourceErrorInfo,
        retry_after: Option<Duration>,
    },
}

impl From<reqwest::Error> for PollError {
    fn from(error: reqwest::Error) -> PollError {
        PollError::Recoverable {
            error: DataSourceErrorInfo::new(
                DataSourceErrorKind::NetworkError,
                None,
                error.without_url().to_string(),
            ),
            retry_after: None,
        }
    }
}

struct FeatureRequester {
    // The client holds a connection pool, so it is reused across polls.
    client: reqwest::Client,
    uri: url::Url,
    sdk_key: String,
    user_agent: String,
    tags: Option<String>,
}

impl FeatureRequester {
    fn new(config: &Config) -> Result<FeatureRequester, url::ParseError> {
        let mut uri = url::Url::parse(&format!("{}{}", config.base_uri, LATEST_ALL_PATH))?;
        if let Some(filter) = &config.payload_filter_key {
            uri.query_pairs_mut().append_pair("filter", filter);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .gzip(true)
            .build()
            .expect("failed to construct HTTP client");
        Ok(FeatureRequester {
            client,
            uri,
            sdk_key: config.sdk_key.clone(),
            user_agent: config.user_agent(),
            tags: config.tag_header_value(),
        })
    }

    async fn fetch(&self) -> Result<AllData, PollError> {
        log::debug!(target: "launchdarkly", "polling for configuration");
        let mut request = self
            .client
            .get(self.uri.clone())
            .header("Authorization", &self.sdk_key)
            .header("User-Agent", &self.user_agent);
        if let Some(tags) = &self.tags {
            request = request.header("X-LaunchDarkly-Tags", tags);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if !is_http_error_recoverable(code) {
                return Err(PollError::Unrecoverable(code));
            }
            let retry_after = (status == StatusCode::TOO_MANY_REQUESTS)
                .then(|| retry_after_duration(&response))
                .flatten();
            return Err(PollError::Recoverable {
                error: DataSourceErrorInfo::new(
                    DataSourceErrorKind::ErrorResponse,
                    Some(code),
                    format!("HTTP error {code} on polling request"),
                ),
                retry_after,
            });
        }
        let all_data = response.json::<AllData>().await.map_err(|error| {
            PollError::Recoverable {
                error: DataSourceErrorInfo::new(
                    DataSourceErrorKind::InvalidData,
                    None,
                    format!("malformed polling response: {error}"),
                ),
                retry_after: None,
            }
        })?;
        log::debug!(target: "launchdarkly",
            flags = all_data.flags.len(), segments = all_data.segments.len();
            "received polling response");
        Ok(all_data)
    }
}

fn retry_after_duration(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Subtract a small random amount from the interval to avoid synchronized polling across a
/// fleet of server instances.
fn jitter(interval: Duration) -> Duration {
    interval.saturating_sub(thread_rng().gen_range(Duration::ZERO..=POLL_JITTER))
}

#[cfg(test)]
mod jitter_tests {
    use super::*;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let result = jitter(interval);
        assert!(result <= interval);
        assert!(result >= interval - POLL_JITTER);
    }

    #[test]
    fn jitter_truncates_to_zero() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
