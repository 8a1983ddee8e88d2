//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::big_segments::BigSegmentsConfig;
use crate::store::DataStore;
use crate::{AttributeRef, SdkMetadata};

/// Default base URI for polling requests.
pub const DEFAULT_BASE_URI: &str = "https://sdk.launchdarkly.com";
/// Default base URI for the streaming connection.
pub const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
/// Default base URI for event delivery.
pub const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
const MIN_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(60);

/// Identifying tags for the application in which the SDK is embedded, sent as
/// `X-LaunchDarkly-Tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub application_id: Option<String>,
    pub application_version: Option<String>,
}

impl ApplicationInfo {
    pub(crate) fn tag_header_value(&self) -> Option<String> {
        let mut tags = Vec::new();
        if let Some(id) = &self.application_id {
            tags.push(format!("application-id/{id}"));
        }
        if let Some(version) = &self.application_version {
            tags.push(format!("application-version/{version}"));
        }
        if tags.is_empty() {
            None
        } else {
            Some(tags.join(" "))
        }
    }
}

/// Immutable configuration for the client core. Build one with [`Config::builder`].
pub struct Config {
    pub sdk_key: String,
    pub base_uri: String,
    pub stream_uri: String,
    pub events_uri: String,
    /// Use the streaming data source; when false, the polling data source is used.
    pub stream: bool,
    pub poll_interval: Duration,
    pub initial_reconnect_delay: Duration,
    /// How long the constructor waits for the first data load.
    pub start_wait: Duration,
    pub offline: bool,
    pub send_events: bool,
    pub events_capacity: usize,
    pub flush_interval: Duration,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<AttributeRef>,
    pub omit_anonymous_contexts: bool,
    pub compress_events: bool,
    pub diagnostic_opt_out: bool,
    pub diagnostic_recording_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Product string used in the `User-Agent` header, combined with the SDK version.
    pub user_agent_product: String,
    pub application_info: Option<ApplicationInfo>,
    /// Optional payload filter appended to data source requests.
    pub payload_filter_key: Option<String>,
    /// Data store override; defaults to the in-memory store.
    pub data_store: Option<Arc<dyn DataStore>>,
    pub big_segments: Option<BigSegmentsConfig>,
    pub sdk_metadata: SdkMetadata,
}

impl Config {
    pub fn builder(sdk_key: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(sdk_key)
    }

    pub(crate) fn user_agent(&self) -> String {
        format!("{}/{}", self.user_agent_product, self.sdk_metadata.version)
    }

    pub(crate) fn tag_header_value(&self) -> Option<String> {
        self.application_info
            .as_ref()
            .and_then(ApplicationInfo::tag_header_value)
    }
}

/// Builder for [`Config`].
///
/// ```
/// # use launchdarkly_core::config::Config;
/// let config = Config::builder("sdk-key")
///     .flush_interval(std::time::Duration::from_secs(2))
///     .build();
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(sdk_key: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                sdk_key: sdk_key.into(),
                base_uri: DEFAULT_BASE_URI.to_owned(),
                stream_uri: DEFAULT_STREAM_URI.to_owned(),
                events_uri: DEFAULT_EVENTS_URI.to_owned(),
                stream: true,
                poll_interval: MIN_POLL_INTERVAL,
                initial_reconnect_delay: Duration::from_secs(1),
                start_wait: Duration::from_secs(5),
                offline: false,
                send_events: true,
                events_capacity: 10_000,
                flush_interval: Duration::from_secs(5),
                context_keys_capacity: 1000,
                context_keys_flush_interval: Duration::from_secs(300),
                all_attributes_private: false,
                private_attributes: Vec::new(),
                omit_anonymous_contexts: false,
                compress_events: false,
                diagnostic_opt_out: false,
                diagnostic_recording_interval: Duration::from_secs(900),
                connect_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(10),
                user_agent_product: "RustClient".to_owned(),
                application_info: None,
                payload_filter_key: None,
                data_store: None,
                big_segments: None,
                sdk_metadata: SdkMetadata::default(),
            },
        }
    }

    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.base_uri = trim_trailing_slash(uri.into());
        self
    }

    pub fn stream_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.stream_uri = trim_trailing_slash(uri.into());
        self
    }

    pub fn events_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.events_uri = trim_trailing_slash(uri.into());
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.initial_reconnect_delay = delay;
        self
    }

    pub fn start_wait(mut self, wait: Duration) -> Self {
        self.config.start_wait = wait;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    pub fn send_events(mut self, send: bool) -> Self {
        self.config.send_events = send;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn context_keys_capacity(mut self, capacity: usize) -> Self {
        self.config.context_keys_capacity = capacity;
        self
    }

    pub fn context_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.config.context_keys_flush_interval = interval;
        self
    }

    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.config.all_attributes_private = private;
        self
    }

    /// Mark attributes as private for every context; accepts plain names or `/`-paths.
    pub fn private_attributes<'a>(mut self, refs: impl IntoIterator<Item = &'a str>) -> Self {
        self.config.private_attributes = refs
            .into_iter()
            .map(AttributeRef::from_path)
            .filter(AttributeRef::is_valid)
            .collect();
        self
    }

    pub fn omit_anonymous_contexts(mut self, omit: bool) -> Self {
        self.config.omit_anonymous_contexts = omit;
        self
    }

    pub fn compress_events(mut self, compress: bool) -> Self {
        self.config.compress_events = compress;
        self
    }

    pub fn diagnostic_opt_out(mut self, opt_out: bool) -> Self {
        self.config.diagnostic_opt_out = opt_out;
        self
    }

    pub fn diagnostic_recording_interval(mut self, interval: Duration) -> Self {
        self.config.diagnostic_recording_interval = interval;
        self
    }

    pub fn user_agent_product(mut self, product: impl Into<String>) -> Self {
        self.config.user_agent_product = product.into();
        self
    }

    pub fn application_info(mut self, info: ApplicationInfo) -> Self {
        self.config.application_info = Some(info);
        self
    }

    pub fn payload_filter_key(mut self, key: impl Into<String>) -> Self {
        self.config.payload_filter_key = Some(key.into());
        self
    }

    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.config.data_store = Some(store);
        self
    }

    pub fn big_segments(mut self, config: BigSegmentsConfig) -> Self {
        self.config.big_segments = Some(config);
        self
    }

    pub fn sdk_metadata(mut self, metadata: SdkMetadata) -> Self {
        self.config.sdk_metadata = metadata;
        self
    }

    pub fn build(mut self) -> Config {
        // Enforce service floors rather than erroring.
        self.config.poll_interval = self.config.poll_interval.max(MIN_POLL_INTERVAL);
        self.config.diagnostic_recording_interval = self
            .config
            .diagnostic_recording_interval
            .max(MIN_DIAGNOSTIC_RECORDING_INTERVAL);
        self.config
    }
}

fn trim_trailing_slash(mut uri: String) -> String {
    while uri.ends_with('/') {
        uri.pop();
    }
    uri
}
