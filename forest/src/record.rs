use crate::condition::Condition;
use crate::object::{Gvk, META_GROUP};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the per-namespace hierarchy record singleton.
pub const RECORD_NAME: &str = "hierarchy";

/// Kind key of the hierarchy record itself, used when a condition affects
/// another namespace's record.
pub fn record_gvk() -> Gvk {
    Gvk::new(META_GROUP, "v1", "Hierarchy")
}

/// Desired hierarchy of a namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HierarchySpec {
    /// Parent namespace; empty for a tree root.
    #[serde(default)]
    pub parent: String,
    /// Children this namespace requires to exist and be parented to it.
    #[serde(default)]
    pub required_children: Vec<String>,
    /// Permits deleting this namespace while it still has required children.
    #[serde(default)]
    pub allow_cascading_delete: bool,
}

/// Observed hierarchy of a namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HierarchyStatus {
    /// Current children, sorted.
    #[serde(default)]
    pub children: Vec<String>,
    /// Local and propagated conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// The per-namespace hierarchy record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HierarchyRecord {
    /// Namespace the record configures.
    pub namespace: String,
    /// Desired state.
    #[serde(default)]
    pub spec: HierarchySpec,
    /// Observed state, written by the controller.
    #[serde(default)]
    pub status: HierarchyStatus,
    /// Set while the record is being torn down.
    #[serde(default)]
    pub deleting: bool,
}

impl HierarchyRecord {
    /// Creates an empty record for a namespace.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

/// Namespace metadata as observed from the cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMeta {
    /// Namespace name.
    pub name: String,
    /// Namespace labels, including controller-written depth labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Set while the namespace is being torn down.
    #[serde(default)]
    pub deleting: bool,
}

impl NamespaceMeta {
    /// Creates metadata for a live namespace.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
