//! Deterministic bucketing for rollouts, experiments, and weighted segment rules.

use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::context::{Context, Kind, DEFAULT_KIND};
use crate::AttributeRef;

// First 15 hex digits of a SHA-1, as an integer; buckets are hash / this scale.
const LONG_SCALE: f64 = 0xFFFF_FFFF_FFFF_FFF_u64 as f64;

/// Compute the bucket of a context in `[0, 1)`.
///
/// The hash input is `"{seed}.{value}"` when a seed is present, otherwise
/// `"{key}.{salt}.{value}"` where key/salt come from the flag (or segment, for weighted segment
/// rules). Returns `None` when the context has no individual context of the bucketing kind; the
/// caller then uses the first bucket and disables experiment attribution.
pub(crate) fn bucket_context(
    seed: Option<i64>,
    context: &Context,
    context_kind: Option<&Kind>,
    key: &str,
    salt: &str,
    bucket_by: Option<&AttributeRef>,
) -> Option<f64> {
    let kind = context_kind.map(Kind::as_str).unwrap_or(DEFAULT_KIND);
    let matched = context.as_kind(kind)?;

    let value = match bucket_by {
        None => Some(Value::String(matched.key().to_owned())),
        Some(reference) => matched.get_value(reference),
    };
    let Some(id) = value.as_ref().and_then(bucketable_string_value) else {
        return Some(0.0);
    };

    let input = match seed {
        Some(seed) => format!("{seed}.{id}"),
        None => format!("{key}.{salt}.{id}"),
    };
    Some(bucket_of(&input))
}

// Only strings and integral numbers are bucketable; booleans, floats, and structured values
// bucket to 0.
fn bucketable_string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}

fn bucket_of(input: &str) -> f64 {
    let digest = Sha1::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    // 15 hex digits fit in 60 bits.
    let value = u64::from_str_radix(&hex[..15], 16).unwrap_or(0);
    value as f64 / LONG_SCALE
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::Context;

    use super::*;

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let context = Context::new("userkey").unwrap();
        let a = bucket_context(None, &context, None, "flag-key", "s", None).unwrap();
        let b = bucket_context(None, &context, None, "flag-key", "s", None).unwrap();
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
    }

    // Known bucket values, matching other server-side SDK implementations.
    #[test]
    fn bucket_known_values() {
        let close = |a: f64, b: f64| (a - b).abs() < 1e-6;

        let context = Context::new("userKeyA").unwrap();
        let bucket = bucket_context(None, &context, None, "hashKey", "saltyA", None).unwrap();
        assert!(close(bucket, 0.42157587), "got {bucket}");

        let context = Context::new("userKeyB").unwrap();
        let bucket = bucket_context(None, &context, None, "hashKey", "saltyA", None).unwrap();
        assert!(close(bucket, 0.6708485), "got {bucket}");

        let context = Context::new("userKeyC").unwrap();
        let bucket = bucket_context(None, &context, None, "hashKey", "saltyA", None).unwrap();
        assert!(close(bucket, 0.10343106), "got {bucket}");
    }

    #[test]
    fn seed_replaces_key_and_salt() {
        let context = Context::new("userkey").unwrap();
        let with_seed = bucket_context(Some(61), &context, None, "flag-key", "s", None).unwrap();
        let with_other_seed =
            bucket_context(Some(62), &context, None, "flag-key", "s", None).unwrap();
        assert_ne!(with_seed, with_other_seed);
        // Key and salt are irrelevant once a seed is present.
        let different_flag = bucket_context(Some(61), &context, None, "other", "t", None).unwrap();
        assert_eq!(with_seed, different_flag);
    }

    #[test]
    fn bucket_by_integer_attribute_matches_string_form() {
        let context = Context::builder("k")
            .set("intAttr", 33333)
            .set("stringAttr", "33333")
            .build()
            .unwrap();
        let by_int = bucket_context(
            None,
            &context,
            None,
            "hashKey",
            "saltyA",
            Some(&AttributeRef::from_path("intAttr")),
        )
        .unwrap();
        let by_string = bucket_context(
            None,
            &context,
            None,
            "hashKey",
            "saltyA",
            Some(&AttributeRef::from_path("stringAttr")),
        )
        .unwrap();
        assert_eq!(by_int, by_string);
    }

    #[test]
    fn unbucketable_values_bucket_to_zero() {
        let context = Context::builder("k")
            .set("float", 1.5)
            .set("bool", true)
            .build()
            .unwrap();
        for attr in ["float", "bool", "missing"] {
            let bucket = bucket_context(
                None,
                &context,
                None,
                "hashKey",
                "saltyA",
                Some(&AttributeRef::from_path(attr)),
            )
            .unwrap();
            assert_eq!(bucket, 0.0, "attribute {attr}");
        }
    }

    #[test]
    fn missing_context_kind_yields_none() {
        let context = Context::new("userkey").unwrap();
        let kind = crate::Kind::try_from("org").unwrap();
        assert_eq!(
            bucket_context(None, &context, Some(&kind), "flag-key", "s", None),
            None
        );
    }

    #[test]
    fn json_values_are_not_bucketable() {
        assert_eq!(bucketable_string_value(&json!({"a": 1})), None);
        assert_eq!(bucketable_string_value(&json!([1])), None);
        assert_eq!(bucketable_string_value(&json!(true)), None);
        assert_eq!(bucketable_string_value(&json!(3.5)), None);
        assert_eq!(bucketable_string_value(&json!(3)), Some("3".to_owned()));
        assert_eq!(bucketable_string_value(&json!("x")), Some("x".to_owned()));
    }
}
