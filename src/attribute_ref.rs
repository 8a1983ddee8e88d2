use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed reference to a context attribute, as used in clauses, `bucket_by` fields, and
/// private-attribute lists.
///
/// A reference is either a plain attribute name, or a `/`-delimited path starting with `/` into a
/// JSON object value, where `~1` escapes `/` and `~0` escapes `~` within a path component.
///
/// Invalid references are retained (so they can round-trip through serialization) but match
/// nothing and report their error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    components: Vec<String>,
    error: Option<&'static str>,
}

const ERR_EMPTY: &str = "attribute reference cannot be empty";
const ERR_SLASH: &str = "attribute reference contained a double slash or a trailing slash";
const ERR_ESCAPE: &str =
    "attribute reference contained an escape character (~) that was not followed by 0 or 1";

impl AttributeRef {
    /// Parse a reference from path syntax: `"name"` or `"/path/to/attr"`.
    pub fn from_path(path: &str) -> AttributeRef {
        if path.is_empty() || path == "/" {
            return AttributeRef::from_error(path, ERR_EMPTY);
        }
        if !path.starts_with('/') {
            return AttributeRef {
                raw: path.to_owned(),
                components: vec![path.to_owned()],
                error: None,
            };
        }
        let mut components = Vec::new();
        for component in path[1..].split('/') {
            if component.is_empty() {
                return AttributeRef::from_error(path, ERR_SLASH);
            }
            match unescape(component) {
                Some(c) => components.push(c),
                None => return AttributeRef::from_error(path, ERR_ESCAPE),
            }
        }
        AttributeRef {
            raw: path.to_owned(),
            components,
            error: None,
        }
    }

    /// Treat `name` as a literal attribute name, even if it contains `/`.
    pub fn from_literal(name: &str) -> AttributeRef {
        if name.is_empty() {
            return AttributeRef::from_error(name, ERR_EMPTY);
        }
        AttributeRef {
            raw: escape(name),
            components: vec![name.to_owned()],
            error: None,
        }
    }

    fn from_error(raw: &str, error: &'static str) -> AttributeRef {
        AttributeRef {
            raw: raw.to_owned(),
            components: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&'static str> {
        self.error
    }

    /// The canonical path form of this reference.
    pub fn as_path(&self) -> &str {
        &self.raw
    }

    /// Number of path components; 0 for an invalid reference.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// True if this is a valid single-component reference to `name`.
    pub fn is_top_level(&self, name: &str) -> bool {
        self.components.len() == 1 && self.components[0] == name
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for AttributeRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for AttributeRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(AttributeRef::from_path(&s))
    }
}

fn unescape(component: &str) -> Option<String> {
    if !component.contains('~') {
        return Some(component.to_owned());
    }
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

fn escape(name: &str) -> String {
    name.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::AttributeRef;

    #[test]
    fn plain_name() {
        let r = AttributeRef::from_path("name");
        assert!(r.is_valid());
        assert_eq!(r.depth(), 1);
        assert_eq!(r.component(0), Some("name"));
        assert_eq!(r.as_path(), "name");
    }

    #[test]
    fn slash_path() {
        let r = AttributeRef::from_path("/address/city");
        assert!(r.is_valid());
        assert_eq!(r.depth(), 2);
        assert_eq!(r.component(0), Some("address"));
        assert_eq!(r.component(1), Some("city"));
    }

    #[test]
    fn escapes() {
        let r = AttributeRef::from_path("/a~1b~0c");
        assert!(r.is_valid());
        assert_eq!(r.component(0), Some("a/b~c"));
    }

    #[test]
    fn invalid_refs() {
        for path in ["", "/", "//", "/a//b", "/a/", "/a~2", "/a~"] {
            let r = AttributeRef::from_path(path);
            assert!(!r.is_valid(), "{path:?} should be invalid");
            assert_eq!(r.depth(), 0);
        }
    }

    #[test]
    fn literal_is_never_a_path() {
        let r = AttributeRef::from_literal("/a/b");
        assert!(r.is_valid());
        assert_eq!(r.depth(), 1);
        assert_eq!(r.component(0), Some("/a/b"));
        assert_eq!(r.as_path(), "~1a~1b");
    }

    #[test]
    fn serde_round_trip() {
        let r = AttributeRef::from_path("/address/city");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"/address/city\"");
        let back: AttributeRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
