//! Clause operator implementations.
//!
//! Every operator is total: a type mismatch, unparsable operand, or unknown operator is a
//! non-match, never an error.

use chrono::DateTime;
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::model::Op;

/// Apply `op` to a single context value and a single clause value.
pub(crate) fn apply(op: Op, context_value: &Value, clause_value: &Value) -> bool {
    match op {
        Op::In => context_value == clause_value,

        Op::StartsWith => string_op(context_value, clause_value, |u, c| u.starts_with(c)),
        Op::EndsWith => string_op(context_value, clause_value, |u, c| u.ends_with(c)),
        Op::Contains => string_op(context_value, clause_value, |u, c| u.contains(c)),
        Op::Matches => string_op(context_value, clause_value, |u, c| {
            // The pattern matches anywhere in the string unless anchored.
            Regex::new(c).map(|re| re.is_match(u)).unwrap_or(false)
        }),

        Op::LessThan => numeric_op(context_value, clause_value, |u, c| u < c),
        Op::LessThanOrEqual => numeric_op(context_value, clause_value, |u, c| u <= c),
        Op::GreaterThan => numeric_op(context_value, clause_value, |u, c| u > c),
        Op::GreaterThanOrEqual => numeric_op(context_value, clause_value, |u, c| u >= c),

        Op::Before => time_op(context_value, clause_value, |u, c| u < c),
        Op::After => time_op(context_value, clause_value, |u, c| u > c),

        Op::SemVerEqual => semver_op(context_value, clause_value, |u, c| u == c),
        Op::SemVerLessThan => semver_op(context_value, clause_value, |u, c| u < c),
        Op::SemVerGreaterThan => semver_op(context_value, clause_value, |u, c| u > c),

        // segmentMatch is handled by the evaluator, not as a scalar operator.
        Op::SegmentMatch | Op::Unknown => false,
    }
}

fn string_op(u: &Value, c: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (u, c) {
        (Value::String(u), Value::String(c)) => f(u, c),
        _ => false,
    }
}

fn numeric_op(u: &Value, c: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (u.as_f64(), c.as_f64()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn time_op(u: &Value, c: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (parse_time(u), parse_time(c)) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

/// A date is either epoch milliseconds or an RFC 3339 timestamp. Anything else (including an
/// unparsable string) is `None`.
fn parse_time(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis() as f64),
        _ => None,
    }
}

fn semver_op(u: &Value, c: &Value, f: impl Fn(&Version, &Version) -> bool) -> bool {
    match (parse_semver(u), parse_semver(c)) {
        (Some(u), Some(c)) => f(&u, &c),
        _ => false,
    }
}

/// Loose semver parsing: missing minor or patch components are treated as zero, so "2" parses
/// as "2.0.0" and "2.1" as "2.1.0".
fn parse_semver(value: &Value) -> Option<Version> {
    let s = value.as_str()?;
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let mut padded = add_zero_version_component(s);
    if let Ok(version) = Version::parse(&padded) {
        return Some(version);
    }
    padded = add_zero_version_component(&padded);
    Version::parse(&padded).ok()
}

fn add_zero_version_component(s: &str) -> String {
    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    format!("{}.0{}", &s[..numeric_end], &s[numeric_end..])
}
