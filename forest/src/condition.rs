use crate::object::Gvk;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Condition codes attached to namespaces. The `Crit*` family halts object
/// propagation into the subtree of the namespace carrying it.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum Code {
    /// The declared parent has no existing namespace.
    CritParentMissing,
    /// The declared parent is the namespace itself or would form a cycle.
    CritParentInvalid,
    /// Some ancestor carries a critical condition.
    CritAncestor,
    /// A declared required child is parented elsewhere, or vice versa.
    CritRequiredChildConflict,
    /// Writing a propagated copy failed.
    CannotUpdate,
    /// Reading or using the source failed, or the source is excluded.
    CannotPropagate,
    /// A propagated copy was edited away from its source.
    ObjectOverridden,
    /// Some descendant holds an overridden copy of a source here.
    ObjectDescendantOverridden,
}

impl Code {
    /// True for conditions that halt propagation into the subtree.
    pub fn is_crit(self) -> bool {
        matches!(
            self,
            Code::CritParentMissing
                | Code::CritParentInvalid
                | Code::CritAncestor
                | Code::CritRequiredChildConflict
        )
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Key a condition is stored under: the `Local` sentinel for conditions
/// describing the namespace itself, or the printable identifier of the
/// object the condition describes.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum ConditionKey {
    /// The condition describes the namespace.
    Local,
    /// The condition describes the object `group/version/kind/namespace/name`.
    Object(String),
}

impl ConditionKey {
    /// Builds an object key from its coordinates.
    pub fn object(gvk: &Gvk, namespace: &str, name: &str) -> Self {
        ConditionKey::Object(crate::object::object_key(gvk, namespace, name))
    }
}

/// The structured form of a non-local condition key.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AffectedObject {
    /// API group; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    #[serde(default)]
    pub version: String,
    /// Kind name.
    #[serde(default)]
    pub kind: String,
    /// Namespace of the affected object.
    #[serde(default)]
    pub namespace: String,
    /// Name of the affected object.
    pub name: String,
}

impl AffectedObject {
    /// Parses a printable object key. An unparseable key yields a
    /// placeholder whose name is the raw key, so bugs stay observable.
    pub fn parse(key: &str) -> Self {
        let parts: Vec<&str> = key.splitn(5, '/').collect();
        match parts.as_slice() {
            [group, version, kind, namespace, name] => Self {
                group: (*group).into(),
                version: (*version).into(),
                kind: (*kind).into(),
                namespace: (*namespace).into(),
                name: (*name).into(),
            },
            _ => Self {
                name: key.into(),
                ..Default::default()
            },
        }
    }
}

/// A condition as written into a hierarchy record's status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition code.
    pub code: Code,
    /// Human-readable diagnostic.
    pub message: String,
    /// Objects the condition is about; empty for local conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affects: Vec<AffectedObject>,
}

/// Per-key condition entries as stored on a forest node.
pub type Entries = SmallVec<[(Code, String); 2]>;

/// Pivots the stored `{key -> [(code, message)]}` map into status records.
/// Entries sharing a code and message merge their affected objects; local
/// entries contribute none. Output is ordered by code then message so status
/// writes stay deterministic.
pub fn flatten(conditions: &BTreeMap<ConditionKey, Entries>) -> Vec<Condition> {
    let mut merged: BTreeMap<(Code, String), Vec<AffectedObject>> = BTreeMap::new();
    for (key, entries) in conditions {
        for (code, message) in entries {
            let affects = merged.entry((*code, message.clone())).or_default();
            if let ConditionKey::Object(raw) = key {
                affects.push(AffectedObject::parse(raw));
            }
        }
    }
    merged
        .into_iter()
        .map(|((code, message), mut affects)| {
            affects.sort();
            affects.dedup();
            Condition {
                code,
                message,
                affects,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn crit_family() {
        assert!(Code::CritParentMissing.is_crit());
        assert!(Code::CritAncestor.is_crit());
        assert!(!Code::CannotUpdate.is_crit());
        assert!(!Code::ObjectOverridden.is_crit());
    }

    #[test]
    fn parse_object_key() {
        let affected = AffectedObject::parse("/v1/Secret/foo/creds");
        assert_eq!(affected.group, "");
        assert_eq!(affected.kind, "Secret");
        assert_eq!(affected.namespace, "foo");
        assert_eq!(affected.name, "creds");
    }

    #[test]
    fn parse_invalid_key_is_observable() {
        let affected = AffectedObject::parse("garbage");
        assert_eq!(affected.name, "garbage");
        assert_eq!(affected.kind, "");
    }

    #[test]
    fn flatten_merges_and_orders() {
        let mut stored: BTreeMap<ConditionKey, Entries> = BTreeMap::new();
        stored.insert(
            ConditionKey::Local,
            smallvec![(Code::CritParentMissing, "parent gone".to_string())],
        );
        stored.insert(
            ConditionKey::Object("/v1/Secret/foo/a".into()),
            smallvec![(Code::CannotPropagate, "finalizers".to_string())],
        );
        stored.insert(
            ConditionKey::Object("/v1/Secret/foo/b".into()),
            smallvec![(Code::CannotPropagate, "finalizers".to_string())],
        );

        let flat = flatten(&stored);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].code, Code::CritParentMissing);
        assert!(flat[0].affects.is_empty());
        assert_eq!(flat[1].code, Code::CannotPropagate);
        let names: Vec<_> = flat[1].affects.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
