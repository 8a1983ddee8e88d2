//! The analytics event pipeline.
//!
//! Public calls produce lightweight *input* events that are posted to a bounded inbox and
//! translated by a single dispatcher thread into the *output* event payload: most evaluations
//! collapse into a summary, contexts are indexed once per interval, private attributes are
//! redacted, and batches are shipped to the events endpoint by a dedicated delivery thread.

pub mod diagnostics;
pub mod processor;

mod context_formatter;
mod output;
mod sender;
mod summarizer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::big_segments::BigSegmentsStatus;
use crate::eval::{is_experiment, ErrorKind, EvaluationDetail, Reason};
use crate::model::Flag;
use crate::Context;

pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A flag evaluation, as reported to the event pipeline.
#[derive(Debug, Clone)]
pub struct EvaluationEvent {
    pub timestamp: u64,
    pub context: Context,
    pub key: String,
    pub flag: Option<Arc<Flag>>,
    pub variation: Option<usize>,
    pub value: Value,
    pub reason: Option<Reason>,
    pub big_segments_status: Option<BigSegmentsStatus>,
    pub default_value: Value,
    pub prereq_of: Option<String>,
    pub track_events: bool,
}

impl EvaluationEvent {
    pub(crate) fn flag_version(&self) -> Option<u64> {
        self.flag.as_ref().map(|f| f.version)
    }

    pub(crate) fn sampling_ratio(&self) -> u32 {
        self.flag.as_ref().map(|f| f.sampling_ratio()).unwrap_or(1)
    }

    pub(crate) fn exclude_from_summaries(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|f| f.exclude_from_summaries)
    }

    pub(crate) fn debug_events_until_date(&self) -> Option<u64> {
        self.flag.as_ref().and_then(|f| f.debug_events_until_date)
    }
}

/// An explicit `identify` call.
#[derive(Debug, Clone)]
pub struct IdentifyEvent {
    pub timestamp: u64,
    pub context: Context,
}

/// A custom event from `track`.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub timestamp: u64,
    pub context: Context,
    pub key: String,
    pub data: Value,
    pub metric_value: Option<f64>,
}

/// Which side of a migration an operation ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOrigin {
    Old,
    New,
}

impl MigrationOrigin {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MigrationOrigin::Old => "old",
            MigrationOrigin::New => "new",
        }
    }
}

/// The operation type of a migration op event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOperation {
    Read,
    Write,
}

impl MigrationOperation {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MigrationOperation::Read => "read",
            MigrationOperation::Write => "write",
        }
    }
}

/// Measurements from one migration-assisted read or write.
#[derive(Debug, Clone)]
pub struct MigrationOpEvent {
    pub timestamp: u64,
    pub context: Context,
    pub key: String,
    pub flag: Option<Arc<Flag>>,
    pub operation: MigrationOperation,
    pub default_stage: Option<String>,
    pub detail: EvaluationDetail,
    pub sampling_ratio: u32,
    pub invoked: Vec<MigrationOrigin>,
    pub consistent: Option<bool>,
    pub consistent_ratio: Option<u32>,
    pub latencies: HashMap<MigrationOrigin, Duration>,
    pub errors: Vec<MigrationOrigin>,
}

/// The inbox message type: everything `send_event` accepts.
#[derive(Debug, Clone)]
pub enum EventInput {
    Eval(EvaluationEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    MigrationOp(MigrationOpEvent),
}

/// Centralized event construction, so the rules about when reasons are attached and when full
/// event tracking is forced live in one place. The client holds two instances: one that always
/// embeds reasons (for the detail methods) and one that does not.
pub(crate) struct EventFactory {
    include_reasons: bool,
}

impl EventFactory {
    pub fn new(include_reasons: bool) -> EventFactory {
        EventFactory { include_reasons }
    }

    pub fn new_eval_event(
        &self,
        flag: &Arc<Flag>,
        context: Context,
        detail: &EvaluationDetail,
        big_segments_status: Option<BigSegmentsStatus>,
        default_value: Value,
        prereq_of: Option<String>,
    ) -> EventInput {
        let experiment = is_experiment(flag, &detail.reason);
        EventInput::Eval(EvaluationEvent {
            timestamp: current_time_millis(),
            context,
            key: flag.key.clone(),
            flag: Some(Arc::clone(flag)),
            variation: detail.variation_index,
            value: detail.value.clone().unwrap_or(default_value.clone()),
            reason: (self.include_reasons || experiment).then(|| detail.reason.clone()),
            big_segments_status,
            default_value,
            prereq_of,
            track_events: flag.track_events || experiment,
        })
    }

    /// An evaluation that failed although the flag exists; the default value was served.
    pub fn new_default_event(
        &self,
        flag: &Arc<Flag>,
        context: Context,
        default_value: Value,
        error_kind: ErrorKind,
    ) -> EventInput {
        EventInput::Eval(EvaluationEvent {
            timestamp: current_time_millis(),
            context,
            key: flag.key.clone(),
            flag: Some(Arc::clone(flag)),
            variation: None,
            value: default_value.clone(),
            reason: self.include_reasons.then(|| Reason::error(error_kind)),
            big_segments_status: None,
            default_value,
            prereq_of: None,
            track_events: flag.track_events,
        })
    }

    /// An evaluation of a flag that does not exist (or before the client initialized).
    pub fn new_unknown_flag_event(
        &self,
        key: &str,
        context: Context,
        default_value: Value,
        error_kind: ErrorKind,
    ) -> EventInput {
        EventInput::Eval(EvaluationEvent {
            timestamp: current_time_millis(),
            context,
            key: key.to_owned(),
            flag: None,
            variation: None,
            value: default_value.clone(),
            reason: self.include_reasons.then(|| Reason::error(error_kind)),
            big_segments_status: None,
            default_value,
            prereq_of: None,
            track_events: false,
        })
    }

    pub fn new_identify_event(&self, context: Context) -> EventInput {
        EventInput::Identify(IdentifyEvent {
            timestamp: current_time_millis(),
            context,
        })
    }

    pub fn new_custom_event(
        &self,
        key: &str,
        context: Context,
        data: Value,
        metric_value: Option<f64>,
    ) -> EventInput {
        EventInput::Custom(CustomEvent {
            timestamp: current_time_millis(),
            context,
            key: key.to_owned(),
            data,
            metric_value,
        })
    }
}
