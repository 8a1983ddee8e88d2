//! A snapshot of all flag values for one context, in the JSON format used to bootstrap
//! client-side SDKs.

use serde::ser::SerializeMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::eval::Reason;
use crate::events::current_time_millis;
use crate::model::Flag;

/// The state of all feature flags with regard to a specific context, produced by
/// `all_flags_state`. Serializing this to JSON produces the bootstrap format expected by
/// client-side SDKs: flag values at the top level plus `$flagsState` metadata and `$valid`.
#[derive(Debug, Clone)]
pub struct FeatureFlagsState {
    valid: bool,
    flag_values: Map<String, Value>,
    flag_metadata: Map<String, Value>,
}

impl FeatureFlagsState {
    pub(crate) fn invalid() -> FeatureFlagsState {
        FeatureFlagsState {
            valid: false,
            flag_values: Map::new(),
            flag_metadata: Map::new(),
        }
    }

    pub(crate) fn valid() -> FeatureFlagsState {
        FeatureFlagsState {
            valid: true,
            flag_values: Map::new(),
            flag_metadata: Map::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_flag(
        &mut self,
        flag: &Flag,
        value: Option<Value>,
        variation: Option<usize>,
        reason: Option<&Reason>,
        requires_experiment_data: bool,
        details_only_if_tracked: bool,
    ) {
        self.flag_values
            .insert(flag.key.clone(), value.unwrap_or(Value::Null));

        let track_events = flag.track_events || requires_experiment_data;
        let mut with_details =
            !details_only_if_tracked || track_events || requires_experiment_data;
        if !with_details {
            if let Some(debug_until) = flag.debug_events_until_date {
                with_details = debug_until > current_time_millis();
            }
        }

        let mut meta = Map::new();
        if with_details {
            meta.insert("version".to_owned(), json!(flag.version));
            if let Some(reason) = reason {
                meta.insert(
                    "reason".to_owned(),
                    serde_json::to_value(reason).unwrap_or(Value::Null),
                );
            }
        }
        if let Some(variation) = variation {
            meta.insert("variation".to_owned(), json!(variation));
        }
        if track_events {
            meta.insert("trackEvents".to_owned(), json!(true));
        }
        if requires_experiment_data {
            meta.insert("trackReason".to_owned(), json!(true));
        }
        if let Some(debug_until) = flag.debug_events_until_date {
            meta.insert("debugEventsUntilDate".to_owned(), json!(debug_until));
        }
        self.flag_metadata.insert(flag.key.clone(), Value::Object(meta));
    }

    /// True if this object contains a valid snapshot; false if the state could not be computed
    /// (the client was offline or not initialized).
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The value of an individual flag at the time the state was recorded. `None` if the flag
    /// served its default or is unknown.
    pub fn flag_value(&self, key: &str) -> Option<&Value> {
        self.flag_values.get(key)
    }

    /// A map of flag keys to values only, without metadata.
    pub fn values_map(&self) -> &Map<String, Value> {
        &self.flag_values
    }
}

impl Serialize for FeatureFlagsState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.flag_values.len() + 2))?;
        for (key, value) in &self.flag_values {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("$flagsState", &self.flag_metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(key: &str, track_events: bool) -> Flag {
        serde_json::from_value(json!({
            "key": key,
            "version": 9,
            "on": true,
            "variations": [false, true],
            "fallthrough": {"variation": 1},
            "trackEvents": track_events,
            "salt": "s"
        }))
        .unwrap()
    }

    #[test]
    fn bootstrap_json_format() {
        let mut state = FeatureFlagsState::valid();
        state.add_flag(&flag("f1", true), Some(json!(true)), Some(1), None, false, false);
        let out = serde_json::to_value(&state).unwrap();
        assert_eq!(
            out,
            json!({
                "f1": true,
                "$flagsState": {
                    "f1": {"version": 9, "variation": 1, "trackEvents": true}
                },
                "$valid": true
            })
        );
    }

    #[test]
    fn details_only_for_tracked_flags_omits_version() {
        let mut state = FeatureFlagsState::valid();
        state.add_flag(&flag("f1", false), Some(json!(true)), Some(1), None, false, true);
        let out = serde_json::to_value(&state).unwrap();
        assert_eq!(out["$flagsState"]["f1"], json!({"variation": 1}));
    }

    #[test]
    fn experiment_data_forces_details_and_track_reason() {
        let mut state = FeatureFlagsState::valid();
        let reason = Reason::Fallthrough {
            in_experiment: true,
        };
        state.add_flag(&flag("f1", false), Some(json!(true)), Some(1), Some(&reason), true, true);
        let meta = &serde_json::to_value(&state).unwrap()["$flagsState"]["f1"];
        assert_eq!(meta["trackReason"], json!(true));
        assert_eq!(meta["trackEvents"], json!(true));
        assert_eq!(meta["version"], json!(9));
        assert_eq!(meta["reason"]["kind"], json!("FALLTHROUGH"));
    }

    #[test]
    fn invalid_state() {
        let state = FeatureFlagsState::invalid();
        assert!(!state.is_valid());
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"$flagsState": {}, "$valid": false})
        );
    }
}
