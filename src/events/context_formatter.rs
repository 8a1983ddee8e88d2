//! Serialization of contexts into event payloads, with private attributes removed.

use serde_json::{Map, Value};

use crate::context::ContextRef;
use crate::{AttributeRef, Context};

/// Formats a context for an event payload, redacting attributes named by the configuration's
/// global private list (or all of them) plus the context's own private list. Every removed
/// reference is listed in `_meta.redactedAttributes`. The built-ins `key`, `kind`, `anonymous`,
/// and `_meta` are never redacted.
pub(crate) struct EventContextFormatter {
    all_attributes_private: bool,
    private_attributes: Vec<AttributeRef>,
}

impl EventContextFormatter {
    pub fn new(all_attributes_private: bool, private_attributes: Vec<AttributeRef>) -> Self {
        EventContextFormatter {
            all_attributes_private,
            private_attributes,
        }
    }

    pub fn format_context(&self, context: &Context) -> Value {
        if context.is_multi() {
            let mut out = Map::new();
            out.insert("kind".to_owned(), Value::String("multi".to_owned()));
            for c in context.individual_contexts() {
                out.insert(c.kind().to_string(), self.format_single(&c, false));
            }
            Value::Object(out)
        } else {
            let c = context.individual_contexts().next().unwrap();
            self.format_single(&c, true)
        }
    }

    fn format_single(&self, context: &ContextRef<'_>, include_kind: bool) -> Value {
        let mut out = Map::new();
        out.insert("key".to_owned(), Value::String(context.key().to_owned()));
        if include_kind {
            out.insert("kind".to_owned(), Value::String(context.kind().to_string()));
        }
        if context.anonymous() {
            out.insert("anonymous".to_owned(), Value::Bool(true));
        }

        let mut all_private = self.private_attributes.clone();
        all_private.extend(
            context
                .private_attributes()
                .iter()
                .filter(|r| r.is_valid())
                .cloned(),
        );
        let mut redacted: Vec<String> = Vec::new();

        if let Some(name) = context.name() {
            if !self.check_whole_attribute_private("name", &all_private, &mut redacted) {
                out.insert("name".to_owned(), Value::String(name.to_owned()));
            }
        }
        for attr in context.custom_attribute_names() {
            if self.check_whole_attribute_private(attr, &all_private, &mut redacted) {
                continue;
            }
            let value = context.custom_attribute(attr).unwrap();
            let mut path = Vec::new();
            out.insert(
                attr.to_owned(),
                redact_nested(&mut path, attr, value, &all_private, &mut redacted),
            );
        }

        if !redacted.is_empty() {
            let meta = Map::from_iter([(
                "redactedAttributes".to_owned(),
                Value::Array(redacted.into_iter().map(Value::String).collect()),
            )]);
            out.insert("_meta".to_owned(), Value::Object(meta));
        }
        Value::Object(out)
    }

    fn check_whole_attribute_private(
        &self,
        attr: &str,
        all_private: &[AttributeRef],
        redacted: &mut Vec<String>,
    ) -> bool {
        if self.all_attributes_private {
            redacted.push(AttributeRef::from_literal(attr).as_path().to_owned());
            return true;
        }
        for private in all_private {
            if private.is_top_level(attr) {
                redacted.push(private.as_path().to_owned());
                return true;
            }
        }
        false
    }
}

// Walks an object value, removing properties matched by a multi-component private reference.
// Scalars and arrays pass through untouched; private paths do not descend into arrays.
fn redact_nested(
    parent_path: &mut Vec<String>,
    name: &str,
    value: &Value,
    all_private: &[AttributeRef],
    redacted: &mut Vec<String>,
) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    if map.is_empty() {
        return value.clone();
    }
    parent_path.push(name.to_owned());
    let mut out = Map::new();
    'properties: for (k, v) in map {
        for private in all_private {
            if private.depth() != parent_path.len() + 1 {
                continue;
            }
            if private.component(parent_path.len()) != Some(k) {
                continue;
            }
            let prefix_matches = parent_path
                .iter()
                .enumerate()
                .all(|(i, component)| private.component(i) == Some(component));
            if prefix_matches {
                redacted.push(private.as_path().to_owned());
                continue 'properties;
            }
        }
        out.insert(
            k.clone(),
            redact_nested(parent_path, k, v, all_private, redacted),
        );
    }
    parent_path.pop();
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn refs(paths: &[&str]) -> Vec<AttributeRef> {
        paths.iter().map(|p| AttributeRef::from_path(p)).collect()
    }

    #[test]
    fn no_redaction_by_default() {
        let formatter = EventContextFormatter::new(false, vec![]);
        let context = Context::builder("a")
            .name("Alice")
            .set("email", "a@example.com")
            .build()
            .unwrap();
        assert_eq!(
            formatter.format_context(&context),
            json!({"kind": "user", "key": "a", "name": "Alice", "email": "a@example.com"})
        );
    }

    #[test]
    fn all_attributes_private_preserves_built_ins() {
        let formatter = EventContextFormatter::new(true, vec![]);
        let context = Context::builder("a")
            .name("Alice")
            .anonymous(true)
            .set("email", "a@example.com")
            .build()
            .unwrap();
        let out = formatter.format_context(&context);
        assert_eq!(out["key"], json!("a"));
        assert_eq!(out["kind"], json!("user"));
        assert_eq!(out["anonymous"], json!(true));
        assert!(out.get("name").is_none());
        assert!(out.get("email").is_none());
        let mut redacted: Vec<String> = serde_json::from_value(
            out["_meta"]["redactedAttributes"].clone(),
        )
        .unwrap();
        redacted.sort();
        assert_eq!(redacted, vec!["email".to_owned(), "name".to_owned()]);
    }

    #[test]
    fn global_and_per_context_private_attributes_combine() {
        let formatter = EventContextFormatter::new(false, refs(&["email"]));
        let context = Context::builder("a")
            .set("email", "a@example.com")
            .set("phone", "555")
            .private("phone")
            .build()
            .unwrap();
        let out = formatter.format_context(&context);
        assert!(out.get("email").is_none());
        assert!(out.get("phone").is_none());
    }

    #[test]
    fn nested_attribute_redaction() {
        let formatter = EventContextFormatter::new(false, refs(&["/address/geo/lat"]));
        let context = Context::builder("a")
            .set(
                "address",
                json!({"city": "Oakland", "geo": {"lat": 37.8, "lon": -122.2}}),
            )
            .build()
            .unwrap();
        let out = formatter.format_context(&context);
        assert_eq!(
            out["address"],
            json!({"city": "Oakland", "geo": {"lon": -122.2}})
        );
        assert_eq!(
            out["_meta"]["redactedAttributes"],
            json!(["/address/geo/lat"])
        );
    }

    #[test]
    fn multi_context_is_redacted_per_part() {
        let formatter = EventContextFormatter::new(false, refs(&["tier"]));
        let context = Context::multi_builder()
            .add(Context::new("u").unwrap())
            .add(Context::builder("o").kind("org").set("tier", "gold").build().unwrap())
            .build()
            .unwrap();
        let out = formatter.format_context(&context);
        assert_eq!(out["kind"], json!("multi"));
        assert_eq!(out["user"], json!({"key": "u"}));
        assert!(out["org"].get("tier").is_none());
    }

    #[test]
    fn invalid_per_context_refs_are_ignored() {
        let formatter = EventContextFormatter::new(false, vec![]);
        let context = Context::builder("a")
            .set("email", "a@example.com")
            .private("//bad")
            .build()
            .unwrap();
        let out = formatter.format_context(&context);
        assert_eq!(out["email"], json!("a@example.com"));
        assert!(out.get("_meta").is_none());
    }
}
