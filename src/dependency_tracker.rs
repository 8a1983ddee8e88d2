//! Tracks which items depend on which: flags on prerequisite flags, flags on segments named in
//! rule clauses, and segments on other segments. The data source uses this to decide which
//! flags' evaluations could be affected by an update.

use std::collections::{HashMap, HashSet};

use crate::model::{Clause, Op};
use crate::store::{DataKind, StoreItem};

/// A kind-qualified item key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct KindAndKey {
    pub kind: DataKind,
    pub key: String,
}

/// Bi-directional dependency map. Keeping both directions makes updates cheap and lets us walk
/// upward from a modified item to everything that could be affected by it.
#[derive(Default)]
pub(crate) struct DependencyTracker {
    children: HashMap<KindAndKey, HashSet<KindAndKey>>,
    parents: HashMap<KindAndKey, HashSet<KindAndKey>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// Record the dependencies of an updated item, replacing whatever was known before.
    pub fn update_dependencies_from(&mut self, kind: DataKind, key: &str, item: &StoreItem) {
        let from = KindAndKey {
            kind,
            key: key.to_owned(),
        };
        let updated = compute_dependencies(item);

        if let Some(old_children) = self.children.get(&from) {
            for child in old_children {
                if let Some(parents) = self.parents.get_mut(child) {
                    parents.remove(&from);
                }
            }
        }
        for child in &updated {
            self.parents.entry(child.clone()).or_default().insert(from.clone());
        }
        self.children.insert(from, updated);
    }

    /// Add `item` and everything that transitively depends on it to `out`.
    pub fn add_affected_items(&self, out: &mut HashSet<KindAndKey>, item: &KindAndKey) {
        if !out.insert(item.clone()) {
            return;
        }
        if let Some(parents) = self.parents.get(item) {
            for parent in parents {
                self.add_affected_items(out, parent);
            }
        }
    }

    pub fn reset(&mut self) {
        self.children.clear();
        self.parents.clear();
    }
}

fn compute_dependencies(item: &StoreItem) -> HashSet<KindAndKey> {
    let mut out = HashSet::new();
    match item {
        StoreItem::Flag(flag) => {
            for prerequisite in &flag.prerequisites {
                out.insert(KindAndKey {
                    kind: DataKind::Flags,
                    key: prerequisite.key.clone(),
                });
            }
            for rule in &flag.rules {
                segment_keys_from_clauses(&mut out, &rule.clauses);
            }
        }
        StoreItem::Segment(segment) => {
            for rule in &segment.rules {
                segment_keys_from_clauses(&mut out, &rule.clauses);
            }
        }
        StoreItem::Tombstone(_) => {}
    }
    out
}

fn segment_keys_from_clauses(out: &mut HashSet<KindAndKey>, clauses: &[Clause]) {
    for clause in clauses {
        if clause.op == Op::SegmentMatch {
            for value in &clause.values {
                if let Some(key) = value.as_str() {
                    out.insert(KindAndKey {
                        kind: DataKind::Segments,
                        key: key.to_owned(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn flag_with_prereq(key: &str, prereq: &str) -> StoreItem {
        StoreItem::parse(
            DataKind::Flags,
            json!({"key": key, "version": 1, "prerequisites": [{"key": prereq, "variation": 0}]}),
        )
        .unwrap()
    }

    fn flag_with_segment(key: &str, segment: &str) -> StoreItem {
        StoreItem::parse(
            DataKind::Flags,
            json!({"key": key, "version": 1, "rules": [
                {"clauses": [{"attribute": "", "op": "segmentMatch", "values": [segment]}]}
            ]}),
        )
        .unwrap()
    }

    fn key_of(kind: DataKind, key: &str) -> KindAndKey {
        KindAndKey {
            kind,
            key: key.to_owned(),
        }
    }

    #[test]
    fn transitive_flag_dependencies() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Flags, "a", &flag_with_prereq("a", "b"));
        tracker.update_dependencies_from(DataKind::Flags, "b", &flag_with_prereq("b", "c"));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &key_of(DataKind::Flags, "c"));
        assert!(affected.contains(&key_of(DataKind::Flags, "a")));
        assert!(affected.contains(&key_of(DataKind::Flags, "b")));
        assert!(affected.contains(&key_of(DataKind::Flags, "c")));
    }

    #[test]
    fn segment_dependencies_reach_flags() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Flags, "f", &flag_with_segment("f", "s"));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &key_of(DataKind::Segments, "s"));
        assert!(affected.contains(&key_of(DataKind::Flags, "f")));
    }

    #[test]
    fn updates_replace_old_dependencies() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Flags, "a", &flag_with_prereq("a", "b"));
        tracker.update_dependencies_from(DataKind::Flags, "a", &flag_with_prereq("a", "c"));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &key_of(DataKind::Flags, "b"));
        assert!(!affected.contains(&key_of(DataKind::Flags, "a")));
    }
}
