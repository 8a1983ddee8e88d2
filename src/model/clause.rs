use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Kind;
use crate::AttributeRef;

/// Clause operators.
///
/// An operator the SDK does not recognize deserializes to [`Op::Unknown`] and never matches, so
/// newer data formats degrade to non-matches rather than errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

/// A single condition within a flag or segment rule: the named attribute of the clause's context
/// is tested against `values` under `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ClauseRepr")]
pub struct Clause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    pub attribute: AttributeRef,
    pub op: Op,
    pub values: Vec<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
}

// Older data (written before context kinds existed) treats the attribute as a literal name;
// data that specifies a contextKind uses path syntax.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClauseRepr {
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    attribute: String,
    op: Op,
    #[serde(default)]
    values: Vec<Value>,
    #[serde(default)]
    negate: bool,
}

impl From<ClauseRepr> for Clause {
    fn from(repr: ClauseRepr) -> Clause {
        let attribute = match repr.context_kind {
            Some(_) => AttributeRef::from_path(&repr.attribute),
            None => AttributeRef::from_literal(&repr.attribute),
        };
        Clause {
            context_kind: repr.context_kind,
            attribute,
            op: repr.op,
            values: repr.values,
            negate: repr.negate,
        }
    }
}
