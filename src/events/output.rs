//! Translation of queued events into the JSON payload shape for the events endpoint.

use serde_json::{json, Map, Value};

use crate::Context;

use super::context_formatter::EventContextFormatter;
use super::summarizer::EventSummary;
use super::{CustomEvent, EvaluationEvent, IdentifyEvent, MigrationOpEvent};

/// An event held in the outbox, ready to be serialized at flush time.
#[derive(Debug, Clone)]
pub(crate) enum OutputEvent {
    Feature(EvaluationEvent),
    Debug(EvaluationEvent),
    Index { timestamp: u64, context: Context },
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    MigrationOp(MigrationOpEvent),
}

pub(crate) struct EventOutputFormatter {
    context_formatter: EventContextFormatter,
}

impl EventOutputFormatter {
    pub fn new(context_formatter: EventContextFormatter) -> Self {
        EventOutputFormatter { context_formatter }
    }

    pub fn make_output_events(&self, events: &[OutputEvent], summary: EventSummary) -> Vec<Value> {
        let mut out: Vec<Value> = events.iter().map(|e| self.make_output_event(e)).collect();
        if !summary.is_empty() {
            out.push(make_summary_event(summary));
        }
        out
    }

    fn make_output_event(&self, event: &OutputEvent) -> Value {
        match event {
            OutputEvent::Feature(e) => {
                let mut out = base_eval_props(e, "feature");
                out.insert("contextKeys".to_owned(), context_keys(&e.context));
                Value::Object(out)
            }
            OutputEvent::Debug(e) => {
                let mut out = base_eval_props(e, "debug");
                out.insert(
                    "context".to_owned(),
                    self.context_formatter.format_context(&e.context),
                );
                Value::Object(out)
            }
            OutputEvent::Index { timestamp, context } => json!({
                "kind": "index",
                "creationDate": timestamp,
                "context": self.context_formatter.format_context(context),
            }),
            OutputEvent::Identify(e) => json!({
                "kind": "identify",
                "creationDate": e.timestamp,
                "context": self.context_formatter.format_context(&e.context),
            }),
            OutputEvent::Custom(e) => {
                let mut out = Map::new();
                out.insert("kind".to_owned(), json!("custom"));
                out.insert("creationDate".to_owned(), json!(e.timestamp));
                out.insert("key".to_owned(), json!(e.key));
                out.insert("contextKeys".to_owned(), context_keys(&e.context));
                if !e.data.is_null() {
                    out.insert("data".to_owned(), e.data.clone());
                }
                if let Some(metric_value) = e.metric_value {
                    out.insert("metricValue".to_owned(), json!(metric_value));
                }
                Value::Object(out)
            }
            OutputEvent::MigrationOp(e) => make_migration_op_event(e),
        }
    }
}

fn context_keys(context: &Context) -> Value {
    let mut keys = Map::new();
    for c in context.individual_contexts() {
        keys.insert(c.kind().to_string(), Value::String(c.key().to_owned()));
    }
    Value::Object(keys)
}

fn base_eval_props(e: &EvaluationEvent, kind: &str) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("kind".to_owned(), json!(kind));
    out.insert("creationDate".to_owned(), json!(e.timestamp));
    out.insert("key".to_owned(), json!(e.key));
    out.insert("value".to_owned(), e.value.clone());
    out.insert("default".to_owned(), e.default_value.clone());
    if let Some(version) = e.flag_version() {
        out.insert("version".to_owned(), json!(version));
    }
    if let Some(variation) = e.variation {
        out.insert("variation".to_owned(), json!(variation));
    }
    if let Some(reason) = &e.reason {
        let mut reason_json = serde_json::to_value(reason).unwrap_or(Value::Null);
        if let (Some(status), Some(obj)) = (e.big_segments_status, reason_json.as_object_mut()) {
            obj.insert(
                "bigSegmentsStatus".to_owned(),
                serde_json::to_value(status).unwrap_or(Value::Null),
            );
        }
        out.insert("reason".to_owned(), reason_json);
    }
    if let Some(prereq_of) = &e.prereq_of {
        out.insert("prereqOf".to_owned(), json!(prereq_of));
    }
    let ratio = e.sampling_ratio();
    if ratio != 1 {
        out.insert("samplingRatio".to_owned(), json!(ratio));
    }
    if e.track_events {
        out.insert("trackEvents".to_owned(), json!(true));
    }
    out
}

fn make_migration_op_event(e: &MigrationOpEvent) -> Value {
    let mut evaluation = Map::new();
    evaluation.insert("key".to_owned(), json!(e.key));
    evaluation.insert(
        "value".to_owned(),
        e.detail.value.clone().unwrap_or(Value::Null),
    );
    if let Some(flag) = &e.flag {
        evaluation.insert("version".to_owned(), json!(flag.version));
    }
    if let Some(default_stage) = &e.default_stage {
        evaluation.insert("default".to_owned(), json!(default_stage));
    }
    if let Some(variation) = e.detail.variation_index {
        evaluation.insert("variation".to_owned(), json!(variation));
    }
    evaluation.insert(
        "reason".to_owned(),
        serde_json::to_value(&e.detail.reason).unwrap_or(Value::Null),
    );

    let mut out = Map::new();
    out.insert("kind".to_owned(), json!("migration_op"));
    out.insert("creationDate".to_owned(), json!(e.timestamp));
    out.insert("operation".to_owned(), json!(e.operation.as_str()));
    out.insert("contextKeys".to_owned(), context_keys(&e.context));
    out.insert("evaluation".to_owned(), Value::Object(evaluation));
    if e.sampling_ratio != 1 {
        out.insert("samplingRatio".to_owned(), json!(e.sampling_ratio));
    }

    let mut measurements = Vec::new();
    if !e.invoked.is_empty() {
        let values: Map<String, Value> = e
            .invoked
            .iter()
            .map(|origin| (origin.as_str().to_owned(), json!(true)))
            .collect();
        measurements.push(json!({"key": "invoked", "values": values}));
    }
    if let Some(consistent) = e.consistent {
        let mut measurement = Map::new();
        measurement.insert("key".to_owned(), json!("consistent"));
        measurement.insert("value".to_owned(), json!(consistent));
        if let Some(ratio) = e.consistent_ratio {
            if ratio != 1 {
                measurement.insert("samplingRatio".to_owned(), json!(ratio));
            }
        }
        measurements.push(Value::Object(measurement));
    }
    if !e.latencies.is_empty() {
        let values: Map<String, Value> = e
            .latencies
            .iter()
            .map(|(origin, latency)| {
                (origin.as_str().to_owned(), json!(latency.as_millis() as u64))
            })
            .collect();
        measurements.push(json!({"key": "latency_ms", "values": values}));
    }
    if !e.errors.is_empty() {
        let values: Map<String, Value> = e
            .errors
            .iter()
            .map(|origin| (origin.as_str().to_owned(), json!(true)))
            .collect();
        measurements.push(json!({"key": "error", "values": values}));
    }
    if !measurements.is_empty() {
        out.insert("measurements".to_owned(), Value::Array(measurements));
    }
    Value::Object(out)
}

fn make_summary_event(summary: EventSummary) -> Value {
    let mut features = Map::new();
    for (flag_key, flag_data) in summary.flags {
        let mut counters = Vec::new();
        for ((variation, version), counter) in flag_data.counters {
            let mut counter_out = Map::new();
            counter_out.insert("count".to_owned(), json!(counter.count));
            counter_out.insert("value".to_owned(), counter.value);
            if let Some(variation) = variation {
                counter_out.insert("variation".to_owned(), json!(variation));
            }
            match version {
                Some(version) => counter_out.insert("version".to_owned(), json!(version)),
                None => counter_out.insert("unknown".to_owned(), json!(true)),
            };
            counters.push(Value::Object(counter_out));
        }
        let mut context_kinds: Vec<&String> = flag_data.context_kinds.iter().collect();
        context_kinds.sort();
        features.insert(
            flag_key,
            json!({
                "default": flag_data.default,
                "contextKinds": context_kinds,
                "counters": counters,
            }),
        );
    }
    json!({
        "kind": "summary",
        "startDate": summary.start_date,
        "endDate": summary.end_date,
        "features": features,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::eval::Reason;
    use crate::big_segments::BigSegmentsStatus;

    use super::super::current_time_millis;
    use super::*;

    fn formatter() -> EventOutputFormatter {
        EventOutputFormatter::new(EventContextFormatter::new(false, vec![]))
    }

    fn eval_event() -> EvaluationEvent {
        let flag: crate::model::Flag = serde_json::from_value(json!({
            "key": "f", "version": 11, "variations": [false, true], "salt": "s"
        }))
        .unwrap();
        EvaluationEvent {
            timestamp: 1000,
            context: Context::new("u").unwrap(),
            key: "f".to_owned(),
            flag: Some(Arc::new(flag)),
            variation: Some(1),
            value: json!(true),
            reason: None,
            big_segments_status: None,
            default_value: json!(false),
            prereq_of: None,
            track_events: false,
        }
    }

    #[test]
    fn feature_event_shape() {
        let out = formatter().make_output_events(&[OutputEvent::Feature(eval_event())], EventSummary::default());
        assert_eq!(
            out[0],
            json!({
                "kind": "feature",
                "creationDate": 1000,
                "key": "f",
                "value": true,
                "default": false,
                "version": 11,
                "variation": 1,
                "contextKeys": {"user": "u"}
            })
        );
    }

    #[test]
    fn reason_carries_big_segments_status() {
        let mut event = eval_event();
        event.reason = Some(Reason::Fallthrough {
            in_experiment: false,
        });
        event.big_segments_status = Some(BigSegmentsStatus::Stale);
        let out =
            formatter().make_output_events(&[OutputEvent::Feature(event)], EventSummary::default());
        assert_eq!(
            out[0]["reason"],
            json!({"kind": "FALLTHROUGH", "bigSegmentsStatus": "STALE"})
        );
    }

    #[test]
    fn prereq_of_is_included() {
        let mut event = eval_event();
        event.prereq_of = Some("parent".to_owned());
        let out =
            formatter().make_output_events(&[OutputEvent::Feature(event)], EventSummary::default());
        assert_eq!(out[0]["prereqOf"], json!("parent"));
    }

    #[test]
    fn debug_event_carries_full_context() {
        let out = formatter().make_output_events(&[OutputEvent::Debug(eval_event())], EventSummary::default());
        assert_eq!(out[0]["kind"], json!("debug"));
        assert_eq!(out[0]["context"], json!({"kind": "user", "key": "u"}));
        assert!(out[0].get("contextKeys").is_none());
    }

    #[test]
    fn summary_event_shape() {
        let mut summarizer = super::super::summarizer::EventSummarizer::new();
        let mut event = eval_event();
        event.timestamp = current_time_millis();
        summarizer.summarize_event(&event);
        summarizer.summarize_event(&event);
        let out = formatter().make_output_events(&[], summarizer.take());
        assert_eq!(out.len(), 1);
        let summary = &out[0];
        assert_eq!(summary["kind"], json!("summary"));
        let feature = &summary["features"]["f"];
        assert_eq!(feature["default"], json!(false));
        assert_eq!(feature["contextKinds"], json!(["user"]));
        assert_eq!(
            feature["counters"],
            json!([{"count": 2, "value": true, "variation": 1, "version": 11}])
        );
    }

    #[test]
    fn unknown_flag_counter_is_marked() {
        let mut summarizer = super::super::summarizer::EventSummarizer::new();
        let mut event = eval_event();
        event.flag = None;
        event.variation = None;
        event.value = json!(false);
        summarizer.summarize_event(&event);
        let out = formatter().make_output_events(&[], summarizer.take());
        assert_eq!(
            out[0]["features"]["f"]["counters"],
            json!([{"count": 1, "value": false, "unknown": true}])
        );
    }

    #[test]
    fn migration_op_event_shape() {
        let event = MigrationOpEvent {
            timestamp: 5,
            context: Context::new("u").unwrap(),
            key: "migration-flag".to_owned(),
            flag: None,
            operation: super::super::MigrationOperation::Read,
            default_stage: Some("off".to_owned()),
            detail: crate::eval::EvaluationDetail {
                value: Some(json!("live")),
                variation_index: Some(0),
                reason: Reason::Fallthrough {
                    in_experiment: false,
                },
            },
            sampling_ratio: 1,
            invoked: vec![
                super::super::MigrationOrigin::Old,
                super::super::MigrationOrigin::New,
            ],
            consistent: Some(true),
            consistent_ratio: None,
            latencies: std::collections::HashMap::from([(
                super::super::MigrationOrigin::Old,
                std::time::Duration::from_millis(30),
            )]),
            errors: vec![],
        };
        let out =
            formatter().make_output_events(&[OutputEvent::MigrationOp(event)], EventSummary::default());
        let op = &out[0];
        assert_eq!(op["kind"], json!("migration_op"));
        assert_eq!(op["operation"], json!("read"));
        assert_eq!(op["evaluation"]["key"], json!("migration-flag"));
        assert_eq!(op["evaluation"]["value"], json!("live"));
        let measurements = op["measurements"].as_array().unwrap();
        assert_eq!(measurements[0]["key"], json!("invoked"));
        assert_eq!(measurements[1], json!({"key": "consistent", "value": true}));
        assert_eq!(
            measurements[2],
            json!({"key": "latency_ms", "values": {"old": 30}})
        );
    }
}
