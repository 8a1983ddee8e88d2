use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Kind;
use crate::AttributeRef;

use super::Clause;

/// A feature flag: a named decision whose output is one of several pre-declared variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub context_targets: Vec<ContextTarget>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_side_availability: Option<ClientSideAvailability>,
    // Predecessor of clientSideAvailability.usingEnvironmentId in older data.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub client_side: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_from_summaries: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationSettings>,
}

impl Flag {
    /// The variation value at `index`, if the index is in range.
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }

    /// Whether this flag is available to client-side SDKs keyed by environment id.
    pub fn is_client_side(&self) -> bool {
        match &self.client_side_availability {
            Some(a) => a.using_environment_id,
            None => self.client_side,
        }
    }

    /// The effective event sampling ratio (default 1).
    pub fn sampling_ratio(&self) -> u32 {
        self.sampling_ratio.unwrap_or(1)
    }
}

/// Client-side visibility settings for a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    #[serde(default)]
    pub using_environment_id: bool,
    #[serde(default)]
    pub using_mobile_key: bool,
}

/// Migration-assistance settings attached to a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_ratio: Option<u32>,
}

/// A direct mapping from a set of context keys (of the default kind) to a variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub variation: usize,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A direct mapping from context keys of a specific kind to a variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    pub variation: usize,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Another flag whose evaluation must produce a specific variation for the current flag to be
/// considered on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// An ordered rule on a flag: all clauses must match, then the rule's variation or rollout is
/// served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub track_events: bool,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
}

/// Either a fixed variation index or a percentage rollout.
///
/// Data that specifies neither is retained as [`VariationOrRollout::Malformed`] and produces a
/// `MALFORMED_FLAG` error at evaluation time rather than failing the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: usize },
    Rollout { rollout: Rollout },
    Malformed(Value),
}

impl Default for VariationOrRollout {
    fn default() -> VariationOrRollout {
        VariationOrRollout::Malformed(Value::Null)
    }
}

/// A deterministic percentage split of contexts across variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RolloutRepr")]
pub struct Rollout {
    #[serde(skip_serializing_if = "is_default_kind")]
    pub kind: RolloutKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<AttributeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    pub variations: Vec<WeightedVariation>,
}

fn is_default_kind(kind: &RolloutKind) -> bool {
    *kind == RolloutKind::Rollout
}

/// Whether a rollout is a plain percentage rollout or an experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

// Like clause attributes, bucketBy is a literal name in data without a contextKind and path
// syntax otherwise.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RolloutRepr {
    #[serde(default)]
    kind: RolloutKind,
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde(default)]
    seed: Option<i64>,
    #[serde(default)]
    variations: Vec<WeightedVariation>,
}

impl From<RolloutRepr> for Rollout {
    fn from(repr: RolloutRepr) -> Rollout {
        let bucket_by = repr.bucket_by.filter(|s| !s.is_empty()).map(|s| {
            match repr.context_kind {
                Some(_) => AttributeRef::from_path(&s),
                None => AttributeRef::from_literal(&s),
            }
        });
        Rollout {
            kind: repr.kind,
            context_kind: repr.context_kind,
            bucket_by,
            seed: repr.seed,
            variations: repr.variations,
        }
    }
}

/// One bucket of a rollout: a variation index and its weight out of 100,000.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untracked: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn minimal_flag_json() -> Value {
        json!({
            "key": "flag-key",
            "version": 3,
            "on": true,
            "variations": [false, true],
            "offVariation": 0,
            "fallthrough": {"variation": 1},
            "salt": "abc"
        })
    }

    #[test]
    fn parse_minimal_flag() {
        let flag: Flag = serde_json::from_value(minimal_flag_json()).unwrap();
        assert_eq!(flag.key, "flag-key");
        assert_eq!(flag.version, 3);
        assert!(flag.on);
        assert_eq!(flag.off_variation, Some(0));
        assert_eq!(
            flag.fallthrough,
            VariationOrRollout::Variation { variation: 1 }
        );
        assert!(flag.rules.is_empty());
        assert_eq!(flag.sampling_ratio(), 1);
    }

    #[test]
    fn missing_fallthrough_is_malformed_not_a_parse_error() {
        let mut json = minimal_flag_json();
        json.as_object_mut().unwrap().remove("fallthrough");
        let flag: Flag = serde_json::from_value(json).unwrap();
        assert!(matches!(flag.fallthrough, VariationOrRollout::Malformed(_)));
    }

    #[test]
    fn parse_rule_with_rollout() {
        let rule: FlagRule = serde_json::from_value(json!({
            "id": "rule-1",
            "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}],
            "rollout": {
                "contextKind": "user",
                "variations": [
                    {"variation": 0, "weight": 60000},
                    {"variation": 1, "weight": 40000, "untracked": true}
                ]
            }
        }))
        .unwrap();
        let VariationOrRollout::Rollout { rollout } = &rule.variation_or_rollout else {
            panic!("expected rollout, got {:?}", rule.variation_or_rollout);
        };
        assert_eq!(rollout.kind, RolloutKind::Rollout);
        assert_eq!(rollout.variations.len(), 2);
        assert!(rollout.variations[1].untracked);
    }

    #[test]
    fn client_side_fallback() {
        let legacy: Flag =
            serde_json::from_value(json!({"key": "f", "version": 1, "clientSide": true})).unwrap();
        assert!(legacy.is_client_side());

        let current: Flag = serde_json::from_value(json!({
            "key": "f",
            "version": 1,
            "clientSide": false,
            "clientSideAvailability": {"usingEnvironmentId": true}
        }))
        .unwrap();
        assert!(current.is_client_side());
    }
}
