//! The client core: wires the store, data source, evaluator, event pipeline, and Big Segment
//! bridge together and exposes the public evaluation surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::big_segments::BigSegmentStoreManager;
use crate::config::Config;
use crate::datasource::polling::PollingDataSource;
use crate::datasource::status::DataSourceStatusProvider;
use crate::datasource::streaming::StreamingDataSource;
use crate::datasource::{DataSource, DataSourceUpdateSink};
use crate::eval::{is_experiment, ErrorKind, EvaluationDetail, Evaluator, Reason};
use crate::events::diagnostics::DiagnosticAccumulator;
use crate::events::processor::EventProcessor;
use crate::events::{EventFactory, EventInput, MigrationOpEvent};
use crate::flag_tracker::FlagTracker;
use crate::flags_state::FeatureFlagsState;
use crate::store::memory::InMemoryDataStore;
use crate::store::{self, DataKind, DataStore};
use crate::Context;

/// Options for [`Client::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsOptions {
    /// Include only flags marked for use by client-side SDKs.
    pub client_side_only: bool,
    /// Include evaluation reasons in the flag metadata.
    pub with_reasons: bool,
    /// Omit metadata that is only used for event generation, unless the flag has event
    /// tracking or debugging turned on.
    pub details_only_for_tracked_flags: bool,
}

/// The client core.
///
/// Constructing one starts the configured data source and event pipeline; the constructor
/// waits up to `start_wait` for the initial data load. A client that has not initialized still
/// evaluates (returning defaults, or last known data if the store has any) rather than failing.
pub struct Client {
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    sink: Arc<DataSourceUpdateSink>,
    data_source: Option<Arc<dyn DataSource>>,
    event_processor: Option<EventProcessor>,
    big_segments: Option<Arc<BigSegmentStoreManager>>,
    flag_tracker: FlagTracker,
    event_factory_default: EventFactory,
    event_factory_with_reasons: EventFactory,
    closed: AtomicBool,
}

impl Client {
    /// Construct the client and start its background components. Blocks up to
    /// `config.start_wait` for the first data load; use [`Client::is_initialized`] to check the
    /// outcome.
    pub fn new(mut config: Config) -> Client {
        let store: Arc<dyn DataStore> = config
            .data_store
            .take()
            .unwrap_or_else(|| Arc::new(InMemoryDataStore::new()));

        let big_segments = config
            .big_segments
            .take()
            .map(|bs| BigSegmentStoreManager::new(bs));

        let config = Arc::new(config);
        let sink = Arc::new(DataSourceUpdateSink::new(Arc::clone(&store)));

        let events_enabled = config.send_events && !config.offline;
        let diagnostics = (events_enabled && !config.diagnostic_opt_out)
            .then(|| Arc::new(DiagnosticAccumulator::new(&config.sdk_key)));
        let event_processor = events_enabled
            .then(|| EventProcessor::new(Arc::clone(&config), diagnostics.clone()));

        let data_source: Option<Arc<dyn DataSource>> = if config.offline {
            log::info!(target: "launchdarkly", "starting client in offline mode");
            None
        } else if config.stream {
            Some(StreamingDataSource::start(
                Arc::clone(&config),
                Arc::clone(&sink),
                diagnostics.clone(),
            ))
        } else {
            log::info!(target: "launchdarkly",
                "streaming is disabled; the client will poll for updates");
            Some(PollingDataSource::start(
                Arc::clone(&config),
                Arc::clone(&sink),
            ))
        };

        let flag_tracker = {
            let store = Arc::clone(&store);
            let big_segments = big_segments.clone();
            FlagTracker::new(
                Arc::clone(sink.flag_change_listeners()),
                Arc::new(move |key: &str, context: &Context| {
                    match store::get_flag(store.as_ref(), key) {
                        Some(flag) => Evaluator::new(store.as_ref(), big_segments.as_deref())
                            .evaluate(&flag, context)
                            .detail
                            .value
                            .unwrap_or(Value::Null),
                        None => Value::Null,
                    }
                }),
            )
        };

        let client = Client {
            config,
            store,
            sink,
            data_source,
            event_processor,
            big_segments,
            flag_tracker,
            event_factory_default: EventFactory::new(false),
            event_factory_with_reasons: EventFactory::new(true),
            closed: AtomicBool::new(false),
        };

        if let Some(data_source) = &client.data_source {
            if !client.config.start_wait.is_zero()
                && !data_source.wait_for_initialization(client.config.start_wait)
            {
                log::warn!(target: "launchdarkly",
                    "client initialization was not completed within the start-wait time; \
                     evaluations will use defaults until data arrives");
            }
        }
        client
    }

    /// True once the data source has loaded its first full snapshot. An offline client is
    /// always considered initialized.
    pub fn is_initialized(&self) -> bool {
        if self.config.offline {
            return true;
        }
        match &self.data_source {
            Some(data_source) => data_source.is_initialized(),
            None => self.store.is_initialized(),
        }
    }

    /// Block up to `timeout` for initialization; returns whether the client initialized.
    pub fn wait_for_initialization(&self, timeout: Duration) -> bool {
        match &self.data_source {
            Some(data_source) => data_source.wait_for_initialization(timeout),
            None => true,
        }
    }

    /// The value of `flag_key` for `context`, or `default` if the flag cannot be evaluated.
    pub fn variation(&self, context: &Context, flag_key: &str, default: Value) -> Value {
        self.evaluate_internal(context, flag_key, default, &self.event_factory_default)
            .value
            .expect("evaluate_internal always fills the value")
    }

    /// Like [`Client::variation`], plus the variation index and evaluation reason. Calling this
    /// also causes reasons to be included in analytics events for this evaluation.
    pub fn variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
    ) -> EvaluationDetail {
        self.evaluate_internal(context, flag_key, default, &self.event_factory_with_reasons)
    }

    fn evaluate_internal(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
        factory: &EventFactory,
    ) -> EvaluationDetail {
        if self.config.offline {
            return EvaluationDetail {
                value: Some(default),
                variation_index: None,
                reason: Reason::error(ErrorKind::ClientNotReady),
            };
        }

        if !self.is_initialized() {
            if self.store.is_initialized() {
                log::warn!(target: "launchdarkly", flag_key;
                    "evaluation attempted before client initialized; using last known flag data");
            } else {
                log::warn!(target: "launchdarkly", flag_key;
                    "evaluation attempted before client initialized; no flag data available yet, returning default");
                self.send_event(factory.new_unknown_flag_event(
                    flag_key,
                    context.clone(),
                    default.clone(),
                    ErrorKind::ClientNotReady,
                ));
                return EvaluationDetail {
                    value: Some(default),
                    variation_index: None,
                    reason: Reason::error(ErrorKind::ClientNotReady),
                };
            }
        }

        let Some(flag) = store::get_flag(self.store.as_ref(), flag_key) else {
            log::info!(target: "launchdarkly", flag_key; "unknown feature flag; returning default value");
            self.send_event(factory.new_unknown_flag_event(
                flag_key,
                context.clone(),
                default.clone(),
                ErrorKind::FlagNotFound,
            ));
            return EvaluationDetail {
                value: Some(default),
                variation_index: None,
                reason: Reason::error(ErrorKind::FlagNotFound),
            };
        };

        let evaluator = Evaluator::new(self.store.as_ref(), self.big_segments.as_deref());
        let result = evaluator.evaluate(&flag, context);

        for prereq in &result.prerequisite_events {
            self.send_event(factory.new_eval_event(
                &prereq.flag,
                context.clone(),
                &prereq.detail,
                result.big_segments_status,
                Value::Null,
                Some(prereq.prereq_of.clone()),
            ));
        }

        let mut detail = result.detail;
        if detail.value.is_none() {
            detail.value = Some(default.clone());
            detail.variation_index = None;
        }
        self.send_event(factory.new_eval_event(
            &flag,
            context.clone(),
            &detail,
            result.big_segments_status,
            default,
            None,
        ));
        detail
    }

    /// The state of all flags for `context`, for bootstrapping client-side SDKs. Generates no
    /// analytics events.
    pub fn all_flags_state(&self, context: &Context, options: AllFlagsOptions) -> FeatureFlagsState {
        if self.config.offline {
            log::warn!(target: "launchdarkly",
                "all_flags_state() called when client is in offline mode; returning empty state");
            return FeatureFlagsState::invalid();
        }
        if !self.is_initialized() && !self.store.is_initialized() {
            log::warn!(target: "launchdarkly",
                "all_flags_state() called before client initialized; no flag data available, returning empty state");
            return FeatureFlagsState::invalid();
        }

        let evaluator = Evaluator::new(self.store.as_ref(), self.big_segments.as_deref());
        let mut state = FeatureFlagsState::valid();
        for (_, item) in self.store.all(DataKind::Flags) {
            let Some(flag) = item.as_flag() else {
                continue;
            };
            if options.client_side_only && !flag.is_client_side() {
                continue;
            }
            let result = evaluator.evaluate(flag, context);
            let requires_experiment_data = is_experiment(flag, &result.detail.reason);
            let reason = (options.with_reasons || requires_experiment_data)
                .then_some(&result.detail.reason);
            state.add_flag(
                flag,
                result.detail.value,
                result.detail.variation_index,
                reason,
                requires_experiment_data,
                options.details_only_for_tracked_flags,
            );
        }
        state
    }

    /// Report a context to the events endpoint, independent of any flag evaluation.
    pub fn identify(&self, context: &Context) {
        self.send_event(self.event_factory_default.new_identify_event(context.clone()));
    }

    /// Record a custom event with optional data and metric value.
    pub fn track(
        &self,
        context: &Context,
        event_key: &str,
        data: Value,
        metric_value: Option<f64>,
    ) {
        self.send_event(self.event_factory_default.new_custom_event(
            event_key,
            context.clone(),
            data,
            metric_value,
        ));
    }

    /// Record the measurements from one migration-assisted operation.
    pub fn track_migration_op(&self, event: MigrationOpEvent) {
        self.send_event(EventInput::MigrationOp(event));
    }

    /// HMAC-SHA-256 of the context's fully-qualified key, keyed by the SDK key, hex-encoded.
    /// Used by client-side SDKs in secure mode.
    pub fn secure_mode_hash(&self, context: &Context) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.sdk_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(context.fully_qualified_key().as_bytes());
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Deliver buffered analytics events as soon as possible. Asynchronous; returns
    /// immediately.
    pub fn flush(&self) {
        if let Some(events) = &self.event_processor {
            events.flush();
        }
    }

    /// Shut down, in order: stop the data source, flush and stop the event pipeline, stop the
    /// Big Segment bridge, and close the data store. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "launchdarkly", "closing client");
        if let Some(data_source) = &self.data_source {
            data_source.stop();
        }
        if let Some(events) = &self.event_processor {
            events.flush();
            events.close();
        }
        if let Some(big_segments) = &self.big_segments {
            big_segments.stop();
        }
        self.store.close();
    }

    /// Status of the data source connection, with change listeners.
    pub fn data_source_status_provider(&self) -> &Arc<DataSourceStatusProvider> {
        self.sink.status_provider()
    }

    /// Listeners for flag configuration and flag value changes.
    pub fn flag_tracker(&self) -> &FlagTracker {
        &self.flag_tracker
    }

    /// The Big Segment bridge, if one is configured.
    pub fn big_segment_store_manager(&self) -> Option<&Arc<BigSegmentStoreManager>> {
        self.big_segments.as_ref()
    }

    fn send_event(&self, event: EventInput) {
        if let Some(events) = &self.event_processor {
            events.send_event(event);
        }
    }

    // Evaluates against a pre-seeded store with no background components.
    #[cfg(test)]
    fn new_with_store(store: Arc<dyn DataStore>) -> Client {
        let sink = Arc::new(DataSourceUpdateSink::new(Arc::clone(&store)));
        Client {
            config: Arc::new(Config::builder("sdk-key").send_events(false).build()),
            store,
            sink,
            data_source: None,
            event_processor: None,
            big_segments: None,
            flag_tracker: FlagTracker::new(
                Arc::new(crate::Listeners::new()),
                Arc::new(|_, _| Value::Null),
            ),
            event_factory_default: EventFactory::new(false),
            event_factory_with_reasons: EventFactory::new(true),
            closed: AtomicBool::new(false),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::store::{AllData, StoreItem};

    use super::*;

    fn offline_client() -> Client {
        Client::new(Config::builder("sdk-key").offline(true).build())
    }

    // A client with a pre-populated store and no background components.
    fn client_with_flags(flags: Vec<Value>) -> Client {
        let store = Arc::new(InMemoryDataStore::new());
        store.init(AllData::default());
        for flag in flags {
            let key = flag["key"].as_str().unwrap().to_owned();
            store.upsert(
                DataKind::Flags,
                &key,
                StoreItem::parse(DataKind::Flags, flag).unwrap(),
            );
        }
        Client::new_with_store(store)
    }

    fn boolean_flag() -> Value {
        json!({
            "key": "flag-key",
            "version": 1,
            "on": true,
            "variations": [false, true],
            "offVariation": 0,
            "fallthrough": {"variation": 1},
            "salt": "s"
        })
    }

    #[test]
    fn offline_client_returns_default() {
        let client = offline_client();
        assert!(client.is_initialized());
        let context = Context::new("a").unwrap();
        let value = client.variation(&context, "any-flag", json!("the-default"));
        assert_eq!(value, json!("the-default"));
        let detail = client.variation_detail(&context, "any-flag", json!(false));
        assert_eq!(detail.reason, Reason::error(ErrorKind::ClientNotReady));
        client.close();
    }

    #[test]
    fn offline_all_flags_state_is_invalid() {
        let client = offline_client();
        let state = client.all_flags_state(&Context::new("a").unwrap(), AllFlagsOptions::default());
        assert!(!state.is_valid());
    }

    #[test]
    fn secure_mode_hash_is_stable_hex() {
        let client = offline_client();
        let context = Context::new("Message").unwrap();
        let hash = client.secure_mode_hash(&context);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Same context, same hash; different context, different hash.
        assert_eq!(hash, client.secure_mode_hash(&context));
        assert_ne!(
            hash,
            client.secure_mode_hash(&Context::new("other").unwrap())
        );
    }

    #[test]
    fn close_is_idempotent() {
        let client = offline_client();
        client.close();
        client.close();
    }

    #[test]
    fn variation_returns_flag_value() {
        let client = client_with_flags(vec![boolean_flag()]);
        assert!(client.is_initialized());
        let context = Context::new("a").unwrap();
        assert_eq!(
            client.variation(&context, "flag-key", json!(false)),
            json!(true)
        );
    }

    #[test]
    fn variation_detail_reports_reason() {
        let client = client_with_flags(vec![boolean_flag()]);
        let context = Context::new("a").unwrap();
        let detail = client.variation_detail(&context, "flag-key", json!(false));
        assert_eq!(detail.value, Some(json!(true)));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(
            detail.reason,
            Reason::Fallthrough {
                in_experiment: false
            }
        );
    }

    #[test]
    fn unknown_flag_returns_default_with_reason() {
        let client = client_with_flags(vec![]);
        let context = Context::new("a").unwrap();
        let detail = client.variation_detail(&context, "missing", json!("dft"));
        assert_eq!(detail.value, Some(json!("dft")));
        assert_eq!(detail.variation_index, None);
        assert_eq!(detail.reason, Reason::error(ErrorKind::FlagNotFound));
    }

    // The default comes back exactly when the detail carries an error reason, or the flag is
    // off with no off variation.
    #[test]
    fn default_iff_error_or_null_off_variation() {
        let mut off_without_variation = boolean_flag();
        off_without_variation["key"] = json!("off-flag");
        off_without_variation["on"] = json!(false);
        off_without_variation.as_object_mut().unwrap().remove("offVariation");
        let client = client_with_flags(vec![boolean_flag(), off_without_variation]);
        let context = Context::new("a").unwrap();

        let detail = client.variation_detail(&context, "flag-key", json!("dft"));
        assert_ne!(detail.value, Some(json!("dft")));
        assert!(!detail.reason.is_error());

        let detail = client.variation_detail(&context, "off-flag", json!("dft"));
        assert_eq!(detail.value, Some(json!("dft")));
        assert_eq!(detail.reason, Reason::Off);

        let detail = client.variation_detail(&context, "missing", json!("dft"));
        assert_eq!(detail.value, Some(json!("dft")));
        assert!(detail.reason.is_error());
    }

    #[test]
    fn all_flags_state_contains_all_values() {
        let mut second = boolean_flag();
        second["key"] = json!("other-flag");
        second["fallthrough"] = json!({"variation": 0});
        let client = client_with_flags(vec![boolean_flag(), second]);
        let state = client.all_flags_state(&Context::new("a").unwrap(), AllFlagsOptions::default());
        assert!(state.is_valid());
        assert_eq!(state.flag_value("flag-key"), Some(&json!(true)));
        assert_eq!(state.flag_value("other-flag"), Some(&json!(false)));
    }

    #[test]
    fn all_flags_state_client_side_filter() {
        let mut client_side = boolean_flag();
        client_side["key"] = json!("cs-flag");
        client_side["clientSideAvailability"] = json!({"usingEnvironmentId": true});
        let client = client_with_flags(vec![boolean_flag(), client_side]);
        let state = client.all_flags_state(
            &Context::new("a").unwrap(),
            AllFlagsOptions {
                client_side_only: true,
                ..AllFlagsOptions::default()
            },
        );
        assert_eq!(state.flag_value("cs-flag"), Some(&json!(true)));
        assert_eq!(state.flag_value("flag-key"), None);
    }
}
