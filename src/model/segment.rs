use serde::{Deserialize, Serialize};

use crate::context::Kind;
use crate::AttributeRef;

use super::Clause;

/// A named reusable set of contexts, defined by inclusion lists, rules, and optionally a large
/// external membership set (a "big segment").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

impl Segment {
    /// The reference string used when looking this segment up in a Big Segment store. The format
    /// is shared with whatever process writes the store, and is independent of the store
    /// implementation.
    pub fn big_segment_ref(&self) -> String {
        format!("{}.g{}", self.key, self.generation.unwrap_or(0))
    }
}

/// An inclusion or exclusion list for context keys of a specific kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A rule within a segment: all clauses must match, and if a weight is present the context must
/// also bucket under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SegmentRuleRepr")]
pub struct SegmentRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub clauses: Vec<Clause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<AttributeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<Kind>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentRuleRepr {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<u32>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde(default)]
    rollout_context_kind: Option<Kind>,
}

impl From<SegmentRuleRepr> for SegmentRule {
    fn from(repr: SegmentRuleRepr) -> SegmentRule {
        let bucket_by = repr.bucket_by.filter(|s| !s.is_empty()).map(|s| {
            match repr.rollout_context_kind {
                Some(_) => AttributeRef::from_path(&s),
                None => AttributeRef::from_literal(&s),
            }
        });
        SegmentRule {
            id: repr.id,
            clauses: repr.clauses,
            weight: repr.weight,
            bucket_by,
            rollout_context_kind: repr.rollout_context_kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_minimal_segment() {
        let segment: Segment = serde_json::from_value(json!({
            "key": "seg",
            "version": 2,
            "included": ["a"],
            "salt": "s"
        }))
        .unwrap();
        assert_eq!(segment.key, "seg");
        assert_eq!(segment.included, vec!["a"]);
        assert!(!segment.unbounded);
    }

    #[test]
    fn big_segment_ref_format() {
        let mut segment: Segment =
            serde_json::from_value(json!({"key": "seg", "version": 1, "generation": 3})).unwrap();
        assert_eq!(segment.big_segment_ref(), "seg.g3");
        segment.generation = None;
        assert_eq!(segment.big_segment_ref(), "seg.g0");
    }

    #[test]
    fn weighted_rule() {
        let rule: SegmentRule = serde_json::from_value(json!({
            "clauses": [{"attribute": "email", "op": "in", "values": ["x"]}],
            "weight": 25000,
            "bucketBy": "email"
        }))
        .unwrap();
        assert_eq!(rule.weight, Some(25000));
        assert!(rule.bucket_by.as_ref().unwrap().is_top_level("email"));
    }
}
