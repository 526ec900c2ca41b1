use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// API group owned by the controller. Labels and annotations under this
/// group are reserved and never propagate.
pub const META_GROUP: &str = "hns.dev";

/// Label marking a propagated copy with the namespace of its source.
pub const INHERITED_FROM: &str = "hns.dev/inheritedFrom";

/// Legacy annotation marking a copy that diverged from its source. The
/// condition taxonomy is authoritative; the annotation is kept for operators
/// watching objects instead of hierarchy records.
pub const MODIFIED_ANNOTATION: &str = "hns.dev/modified";

const DEPTH_SUFFIX: &str = ".tree.hns.dev/depth";

/// Returns the tree-depth label key for an ancestor namespace.
pub fn depth_label(ancestor: &str) -> String {
    format!("{}{}", ancestor, DEPTH_SUFFIX)
}

/// Returns true for tree-depth label keys.
pub fn is_depth_label(key: &str) -> bool {
    key.ends_with(DEPTH_SUFFIX)
}

/// Returns true for label/annotation keys reserved by the controller.
pub fn is_meta_key(key: &str) -> bool {
    key.starts_with("hns.dev/") || key.contains(".tree.hns.dev/")
}

/// An opaque object kind, keyed by group, version and kind.
#[derive(
    Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct Gvk {
    /// API group; empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind name.
    pub kind: String,
}

impl Gvk {
    /// Creates a kind key.
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Creates a core-group kind key.
    pub fn core(version: &str, kind: &str) -> Self {
        Self::new("", version, kind)
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        write!(f, "{}/{}/{}", group, self.version, self.kind)
    }
}

/// An object tracked by the controller. Kinds are opaque; the payload is
/// carried verbatim in `data` and never interpreted beyond canonicalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Kind key.
    pub gvk: Gvk,
    /// Namespace holding the object.
    pub namespace: String,
    /// Object name, unique per kind and namespace.
    pub name: String,
    /// Identity delegated by the cluster on creation.
    #[serde(default)]
    pub uid: u64,
    /// Object labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Object annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers; their presence blocks propagation.
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Opaque spec payload.
    #[serde(default)]
    pub data: Value,
    /// Opaque status payload, dropped from the canonical form.
    #[serde(default)]
    pub status: Value,
}

impl Object {
    /// Creates an empty object of a kind.
    pub fn new(gvk: Gvk, namespace: &str, name: &str) -> Self {
        Self {
            gvk,
            namespace: namespace.into(),
            name: name.into(),
            uid: 0,
            labels: Default::default(),
            annotations: Default::default(),
            finalizers: Default::default(),
            data: Value::Null,
            status: Value::Null,
        }
    }

    /// Returns the source namespace if this object is a propagated copy.
    pub fn inherited_from(&self) -> Option<&str> {
        self.labels.get(INHERITED_FROM).map(|s| s.as_str())
    }

    /// Returns true if this object originated in its own namespace.
    pub fn is_source(&self) -> bool {
        self.inherited_from().is_none()
    }

    /// Returns true if the object must not be propagated: it carries
    /// finalizers, or its kind-specific blacklist applies (service-account
    /// token secrets are tied to their namespace).
    pub fn propagation_blocked(&self) -> Option<&'static str> {
        if !self.finalizers.is_empty() {
            return Some("object has finalizers");
        }
        if self.gvk.kind == "Secret"
            && self.data.get("type").and_then(Value::as_str)
                == Some("kubernetes.io/service-account-token")
        {
            return Some("service account token secrets are not propagated");
        }
        None
    }

    /// The canonical form: name, spec payload and unreserved metadata.
    /// Status, namespace, uid and finalizers are dropped, as is everything
    /// under the reserved group, so two canonical objects comparing equal are
    /// semantically identical regardless of where they live.
    pub fn canonical(&self) -> Canonical {
        Canonical {
            name: self.name.clone(),
            labels: strip_meta(&self.labels),
            annotations: strip_meta(&self.annotations),
            data: self.data.clone(),
        }
    }

    /// Builds the propagated copy of this source for a descendant namespace.
    pub fn propagate_to(&self, namespace: &str) -> Object {
        let mut labels = strip_meta(&self.labels);
        labels.insert(INHERITED_FROM.into(), self.namespace.clone());
        Object {
            gvk: self.gvk.clone(),
            namespace: namespace.into(),
            name: self.name.clone(),
            uid: 0,
            labels,
            annotations: strip_meta(&self.annotations),
            finalizers: Vec::new(),
            data: self.data.clone(),
            status: Value::Null,
        }
    }

    /// The printable object identifier `group/version/kind/namespace/name`.
    pub fn key(&self) -> String {
        object_key(&self.gvk, &self.namespace, &self.name)
    }
}

/// Formats the printable object identifier used as a condition key.
pub fn object_key(gvk: &Gvk, namespace: &str, name: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        gvk.group, gvk.version, gvk.kind, namespace, name
    )
}

fn strip_meta(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .filter(|(k, _)| !is_meta_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The canonical form of an object, used for semantic equality.
#[derive(Clone, Debug, PartialEq)]
pub struct Canonical {
    /// Object name.
    pub name: String,
    /// Unreserved labels.
    pub labels: BTreeMap<String, String>,
    /// Unreserved annotations.
    pub annotations: BTreeMap<String, String>,
    /// Spec payload.
    pub data: Value,
}
