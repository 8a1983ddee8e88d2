//! The evaluation context model.
//!
//! A [`Context`] is the subject of every flag evaluation: a single-kind record (a user, an
//! account, a device) or a multi-kind composite of several of those. Contexts are immutable once
//! built; construction goes through [`ContextBuilder`] or [`MultiContextBuilder`], which validate
//! kinds and keys so that an invalid context cannot exist as a value.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AttributeRef;

/// The default context kind.
pub const DEFAULT_KIND: &str = "user";

/// The kind used by multi-kind contexts.
pub const MULTI_KIND: &str = "multi";

/// A validated context kind: non-empty, `[A-Za-z0-9._-]+`, and not the reserved words `kind` or
/// `multi`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Kind(String);

impl Kind {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }
}

impl Default for Kind {
    fn default() -> Kind {
        Kind(DEFAULT_KIND.to_owned())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Kind {
    type Error = ContextError;

    fn try_from(value: &str) -> Result<Kind, ContextError> {
        validate_kind(value)?;
        Ok(Kind(value.to_owned()))
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Kind, D::Error> {
        let s = String::deserialize(deserializer)?;
        Kind::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

fn validate_kind(kind: &str) -> Result<(), ContextError> {
    if kind.is_empty() {
        return Err(ContextError::EmptyKind);
    }
    if kind == "kind" || kind == MULTI_KIND {
        return Err(ContextError::ReservedKind);
    }
    if !kind
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    {
        return Err(ContextError::InvalidKindCharacters);
    }
    Ok(())
}

/// Reasons a context could not be constructed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextError {
    #[error("context key must not be empty")]
    EmptyKey,
    #[error("context kind must not be empty")]
    EmptyKind,
    #[error("context kind is a reserved word")]
    ReservedKind,
    #[error("context kind contains disallowed characters")]
    InvalidKindCharacters,
    #[error("multi-context must contain at least one kind")]
    EmptyMulti,
    #[error("multi-context cannot have the same kind more than once")]
    DuplicateKind,
    #[error("multi-context parts must be single-kind contexts")]
    NestedMulti,
    #[error("could not parse context JSON: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq)]
struct SingleContext {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: BTreeMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

#[derive(Debug, Clone, PartialEq)]
enum ContextParts {
    Single(SingleContext),
    // Sorted by kind at construction time; kinds are unique.
    Multi(Vec<SingleContext>),
}

/// A collection of attributes that can be referenced in flag evaluations and analytics events;
/// also called an "evaluation context".
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    parts: ContextParts,
    full_key: String,
}

impl Context {
    /// Shortcut for building a single-kind context of the default (`user`) kind with only a key.
    pub fn new(key: impl Into<String>) -> Result<Context, ContextError> {
        ContextBuilder::new(key).build()
    }

    /// Start building a single-kind context.
    pub fn builder(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(key)
    }

    /// Start building a multi-kind context.
    pub fn multi_builder() -> MultiContextBuilder {
        MultiContextBuilder::new()
    }

    /// True if this is a multi-kind context.
    pub fn is_multi(&self) -> bool {
        matches!(self.parts, ContextParts::Multi(_))
    }

    /// The context's kind; `multi` for multi-kind contexts.
    pub fn kind_str(&self) -> &str {
        match &self.parts {
            ContextParts::Single(c) => c.kind.as_str(),
            ContextParts::Multi(_) => MULTI_KIND,
        }
    }

    /// The key of a single-kind context; empty for multi-kind contexts.
    pub fn key(&self) -> &str {
        match &self.parts {
            ContextParts::Single(c) => &c.key,
            ContextParts::Multi(_) => "",
        }
    }

    /// A string that identifies the context uniquely based on all of its kinds and keys.
    ///
    /// For a single-kind context of the default kind this is the key itself; otherwise kinds and
    /// escaped keys are joined with `:`, parts sorted by kind.
    pub fn fully_qualified_key(&self) -> &str {
        &self.full_key
    }

    /// Number of individual (single-kind) contexts contained in this context.
    pub fn individual_context_count(&self) -> usize {
        match &self.parts {
            ContextParts::Single(_) => 1,
            ContextParts::Multi(parts) => parts.len(),
        }
    }

    /// The kinds of every individual context.
    pub fn kinds(&self) -> Vec<&Kind> {
        match &self.parts {
            ContextParts::Single(c) => vec![&c.kind],
            ContextParts::Multi(parts) => parts.iter().map(|c| &c.kind).collect(),
        }
    }

    /// Select the individual context of the given kind, if present. For a single-kind context
    /// this is the context itself when the kind matches.
    pub fn as_kind(&self, kind: &str) -> Option<ContextRef<'_>> {
        match &self.parts {
            ContextParts::Single(c) if c.kind.as_str() == kind => Some(ContextRef { inner: c }),
            ContextParts::Single(_) => None,
            ContextParts::Multi(parts) => parts
                .iter()
                .find(|c| c.kind.as_str() == kind)
                .map(|c| ContextRef { inner: c }),
        }
    }

    /// Iterate over every individual context.
    pub fn individual_contexts(&self) -> impl Iterator<Item = ContextRef<'_>> {
        let parts: &[SingleContext] = match &self.parts {
            ContextParts::Single(c) => std::slice::from_ref(c),
            ContextParts::Multi(parts) => parts,
        };
        parts.iter().map(|c| ContextRef { inner: c })
    }

    /// True if every individual context is anonymous.
    pub fn all_anonymous(&self) -> bool {
        self.individual_contexts().all(|c| c.anonymous())
    }
}

/// A borrowed view of one individual (single-kind) context.
#[derive(Clone, Copy)]
pub struct ContextRef<'a> {
    inner: &'a SingleContext,
}

impl<'a> ContextRef<'a> {
    pub fn kind(&self) -> &'a Kind {
        &self.inner.kind
    }

    pub fn key(&self) -> &'a str {
        &self.inner.key
    }

    pub fn name(&self) -> Option<&'a str> {
        self.inner.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.inner.anonymous
    }

    /// The per-context private attribute references, in the order they were added.
    pub fn private_attributes(&self) -> &'a [AttributeRef] {
        &self.inner.private_attributes
    }

    /// Names of the custom attributes (not including built-ins).
    pub fn custom_attribute_names(&self) -> impl Iterator<Item = &'a str> {
        self.inner.attributes.keys().map(String::as_str)
    }

    pub fn custom_attribute(&self, name: &str) -> Option<&'a Value> {
        self.inner.attributes.get(name)
    }

    /// Resolve an attribute reference against this context, synthesizing values for the
    /// built-in attributes `key`, `kind`, `name`, and `anonymous`.
    ///
    /// Returns `None` for invalid references, missing attributes, and paths that descend into
    /// non-objects.
    pub fn get_value(&self, reference: &AttributeRef) -> Option<Value> {
        let first = reference.component(0)?;
        let mut value = if reference.depth() == 1 {
            match first {
                "key" => return Some(Value::String(self.inner.key.clone())),
                "kind" => return Some(Value::String(self.inner.kind.as_str().to_owned())),
                "name" => return self.inner.name.clone().map(Value::String),
                "anonymous" => return Some(Value::Bool(self.inner.anonymous)),
                _ => return self.inner.attributes.get(first).cloned(),
            }
        } else {
            self.resolve_top_level(first)?
        };
        for component in &reference.components()[1..] {
            match value {
                Value::Object(mut map) => value = map.remove(component.as_str())?,
                _ => return None,
            }
        }
        Some(value)
    }

    fn resolve_top_level(&self, name: &str) -> Option<Value> {
        match name {
            "name" => self.inner.name.clone().map(Value::String),
            // key/kind/anonymous are scalars; a multi-component path into them never resolves.
            "key" | "kind" | "anonymous" => None,
            _ => self.inner.attributes.get(name).cloned(),
        }
    }
}

/// Builder for single-kind contexts.
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: BTreeMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            kind: DEFAULT_KIND.to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: BTreeMap::new(),
            private_attributes: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Set a custom attribute. The reserved names `key`, `kind`, `name`, `anonymous`, and
    /// `_meta` are routed to their dedicated fields (or ignored when the type does not match)
    /// so that the attribute map never contains them.
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match (name, value) {
            ("key", Value::String(s)) => self.key = s,
            ("kind", Value::String(s)) => self.kind = s,
            ("name", Value::String(s)) => self.name = Some(s),
            ("name", Value::Null) => self.name = None,
            ("anonymous", Value::Bool(b)) => self.anonymous = b,
            ("key" | "kind" | "name" | "anonymous" | "_meta", _) => {}
            (_, Value::Null) => {
                self.attributes.remove(name);
            }
            (_, value) => {
                self.attributes.insert(name.to_owned(), value);
            }
        }
        self
    }

    /// Mark an attribute as private for this context. Accepts either a plain name or a
    /// `/`-delimited path.
    pub fn private(mut self, reference: &str) -> Self {
        self.private_attributes.push(AttributeRef::from_path(reference));
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        let kind = Kind::try_from(self.kind.as_str())?;
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        let single = SingleContext {
            kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
            private_attributes: self.private_attributes,
        };
        let full_key = single_full_key(&single);
        Ok(Context {
            parts: ContextParts::Single(single),
            full_key,
        })
    }
}

/// Builder for multi-kind contexts.
#[derive(Default)]
pub struct MultiContextBuilder {
    parts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> MultiContextBuilder {
        MultiContextBuilder::default()
    }

    pub fn add(mut self, context: Context) -> Self {
        self.parts.push(context);
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        if self.parts.is_empty() {
            return Err(ContextError::EmptyMulti);
        }
        if self.parts.len() == 1 {
            // A multi-context of one kind is just that context.
            return Ok(self.parts.into_iter().next().unwrap());
        }
        let mut singles = Vec::with_capacity(self.parts.len());
        for part in self.parts {
            match part.parts {
                ContextParts::Single(c) => singles.push(c),
                ContextParts::Multi(_) => return Err(ContextError::NestedMulti),
            }
        }
        // Sorted by kind: required for the fully-qualified key, and it makes equality and
        // iteration order deterministic.
        singles.sort_by(|a, b| a.kind.cmp(&b.kind));
        if singles.windows(2).any(|w| w[0].kind == w[1].kind) {
            return Err(ContextError::DuplicateKind);
        }
        let full_key = singles
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Context {
            parts: ContextParts::Multi(singles),
            full_key,
        })
    }
}

fn single_full_key(c: &SingleContext) -> String {
    if c.kind.is_user() {
        c.key.clone()
    } else {
        format!("{}:{}", c.kind, escape_key(&c.key))
    }
}

// ':' and '%' are percent-escaped when building a fully-qualified key. This is deliberately not
// a full URL-encoding; implementations of those differ across platforms.
fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

// Serialization uses the canonical context JSON format: single-kind contexts carry their kind
// inline, multi-kind contexts nest each part under its kind with `"kind": "multi"` at the top.

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.parts {
            ContextParts::Single(c) => serialize_single(c, true, serializer),
            ContextParts::Multi(parts) => {
                let mut map = serializer.serialize_map(Some(parts.len() + 1))?;
                map.serialize_entry("kind", MULTI_KIND)?;
                for part in parts {
                    map.serialize_entry(part.kind.as_str(), &SingleNoKind { inner: part })?;
                }
                map.end()
            }
        }
    }
}

struct SingleNoKind<'a> {
    inner: &'a SingleContext,
}

impl Serialize for SingleNoKind<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_single(self.inner, false, serializer)
    }
}

fn serialize_single<S: Serializer>(
    c: &SingleContext,
    include_kind: bool,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    if include_kind {
        map.serialize_entry("kind", c.kind.as_str())?;
    }
    map.serialize_entry("key", &c.key)?;
    if let Some(name) = &c.name {
        map.serialize_entry("name", name)?;
    }
    if c.anonymous {
        map.serialize_entry("anonymous", &true)?;
    }
    for (name, value) in &c.attributes {
        map.serialize_entry(name, value)?;
    }
    if !c.private_attributes.is_empty() {
        let meta = serde_json::json!({ "privateAttributes": c.private_attributes });
        map.serialize_entry("_meta", &meta)?;
    }
    map.end()
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Context, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Context::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for Context {
    type Error = ContextError;

    fn try_from(value: Value) -> Result<Context, ContextError> {
        let Value::Object(mut map) = value else {
            return Err(ContextError::Parse("context must be a JSON object".into()));
        };
        match map.get("kind") {
            Some(Value::String(k)) if k == MULTI_KIND => {
                map.remove("kind");
                let mut builder = MultiContextBuilder::new();
                for (kind, part) in map {
                    builder = builder.add(single_from_value(part, Some(kind))?);
                }
                builder.build()
            }
            Some(Value::String(_)) => single_from_value(Value::Object(map), None),
            Some(_) => Err(ContextError::Parse("\"kind\" must be a string".into())),
            None => single_from_value(Value::Object(map), None),
        }
    }
}

fn single_from_value(value: Value, kind: Option<String>) -> Result<Context, ContextError> {
    let Value::Object(map) = value else {
        return Err(ContextError::Parse("context part must be a JSON object".into()));
    };
    let mut builder = match map.get("key") {
        Some(Value::String(key)) => ContextBuilder::new(key.clone()),
        _ => return Err(ContextError::Parse("\"key\" must be a string".into())),
    };
    if let Some(kind) = kind {
        builder = builder.kind(kind);
    }
    for (name, value) in map {
        if name == "key" {
            continue;
        }
        if name == "_meta" {
            if let Value::Object(mut meta) = value {
                if let Some(Value::Array(refs)) = meta.remove("privateAttributes") {
                    for r in refs {
                        if let Value::String(path) = r {
                            builder = builder.private(&path);
                        }
                    }
                }
            }
            continue;
        }
        builder = builder.set(&name, value);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_context() {
        let c = Context::new("alice").unwrap();
        assert_eq!(c.kind_str(), "user");
        assert_eq!(c.key(), "alice");
        assert_eq!(c.fully_qualified_key(), "alice");
        assert!(!c.is_multi());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(Context::new("").unwrap_err(), ContextError::EmptyKey);
    }

    #[test]
    fn kind_validation() {
        assert!(Context::builder("x").kind("org").build().is_ok());
        assert!(Context::builder("x").kind("Org.2_a-b").build().is_ok());
        for kind in ["", "kind", "multi", "org unit", "ørg"] {
            assert!(
                Context::builder("x").kind(kind).build().is_err(),
                "{kind:?} should be rejected"
            );
        }
    }

    #[test]
    fn non_user_full_key_is_escaped() {
        let c = Context::builder("a:b%c").kind("org").build().unwrap();
        assert_eq!(c.fully_qualified_key(), "org:a%3Ab%25c");
    }

    #[test]
    fn multi_full_key_is_sorted_by_kind() {
        let user = Context::new("u1").unwrap();
        let org = Context::builder("o1").kind("org").build().unwrap();
        let c = Context::multi_builder().add(user).add(org).build().unwrap();
        assert_eq!(c.fully_qualified_key(), "org:o1:user:u1");
        assert_eq!(c.individual_context_count(), 2);
    }

    #[test]
    fn multi_rejects_duplicate_kind() {
        let a = Context::new("a").unwrap();
        let b = Context::new("b").unwrap();
        assert_eq!(
            Context::multi_builder().add(a).add(b).build().unwrap_err(),
            ContextError::DuplicateKind
        );
    }

    #[test]
    fn multi_of_one_collapses_to_single() {
        let c = Context::multi_builder()
            .add(Context::new("a").unwrap())
            .build()
            .unwrap();
        assert!(!c.is_multi());
    }

    #[test]
    fn reserved_attributes_never_land_in_the_map() {
        let c = Context::builder("a")
            .set("kind", "org")
            .set("anonymous", true)
            .set("email", "a@example.com")
            .build()
            .unwrap();
        let single = c.as_kind("org").unwrap();
        assert!(single.anonymous());
        assert_eq!(single.custom_attribute("kind"), None);
        assert_eq!(single.custom_attribute("anonymous"), None);
        assert_eq!(
            single.custom_attribute("email"),
            Some(&json!("a@example.com"))
        );
    }

    #[test]
    fn get_value_built_ins_and_paths() {
        let c = Context::builder("a")
            .kind("org")
            .name("Acme")
            .set("address", json!({"city": "Oakland", "geo": {"lat": 37.8}}))
            .build()
            .unwrap();
        let single = c.as_kind("org").unwrap();
        assert_eq!(
            single.get_value(&AttributeRef::from_path("key")),
            Some(json!("a"))
        );
        assert_eq!(
            single.get_value(&AttributeRef::from_path("kind")),
            Some(json!("org"))
        );
        assert_eq!(
            single.get_value(&AttributeRef::from_path("name")),
            Some(json!("Acme"))
        );
        assert_eq!(
            single.get_value(&AttributeRef::from_path("/address/city")),
            Some(json!("Oakland"))
        );
        assert_eq!(
            single.get_value(&AttributeRef::from_path("/address/geo/lat")),
            Some(json!(37.8))
        );
        assert_eq!(single.get_value(&AttributeRef::from_path("/address/zip")), None);
        assert_eq!(single.get_value(&AttributeRef::from_path("/key/sub")), None);
    }

    #[test]
    fn serde_round_trip_single() {
        let c = Context::builder("a")
            .kind("org")
            .name("Acme")
            .anonymous(true)
            .set("tier", "gold")
            .private("/tier")
            .build()
            .unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "org",
                "key": "a",
                "name": "Acme",
                "anonymous": true,
                "tier": "gold",
                "_meta": {"privateAttributes": ["/tier"]}
            })
        );
        let back: Context = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn serde_round_trip_multi() {
        let c = Context::multi_builder()
            .add(Context::new("u1").unwrap())
            .add(Context::builder("o1").kind("org").set("tier", 3).build().unwrap())
            .build()
            .unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "multi",
                "org": {"key": "o1", "tier": 3},
                "user": {"key": "u1"}
            })
        );
        let back: Context = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn deserialize_defaults_to_user_kind() {
        let c: Context = serde_json::from_value(json!({"key": "a"})).unwrap();
        assert_eq!(c.kind_str(), "user");
    }
}
