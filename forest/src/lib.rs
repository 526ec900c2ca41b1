//! # The hns reconciliation engine
//!
//! ## Forest
//! The workhorse of this crate is the forest: one node per namespace name
//! ever observed or referenced, linked into trees by name indices rather
//! than owning pointers. A single coarse mutex guards the whole structure.
//! The lock is the only synchronization primitive around forest state and is
//! never held across an API call: reconcilers take it to *decide*, release
//! it, then *act*.
//!
//! Whenever the lock is released the forest satisfies four invariants:
//!
//! - the parent relation is acyclic; an assignment that would close a cycle
//! fails with a diagnostic naming the offending chain
//! - children sets mirror parent indices exactly
//! - a namespace not confirmed by the cluster owns no parent edge
//! - conditions stored under the local sentinel describe the namespace,
//! conditions stored under an object key describe that object
//!
//! A node is created on first reference (a parent declaration, a
//! required-child claim, or an actual observation) and garbage collected
//! once it neither exists nor carries children, conditions or claims.
//!
//! ## Reconcilers
//! The hierarchy reconciler syncs one namespace's hierarchy record with the
//! forest: parent edge, required children, tree-depth labels, and the
//! condition set, including the synthetic ancestor condition propagated to
//! every descendant of a namespace in a critical state. One object
//! reconciler per tracked kind classifies each object under the forest lock
//! as either a source or a propagated copy, and then creates, overwrites or
//! deletes copies so that every descendant namespace mirrors the canonical
//! form of the nearest ancestor source.
//!
//! Canonical form is the object minus status, namespace, delegated identity
//! and every label or annotation under the reserved group. Two objects with
//! equal canonical forms are semantically identical, which makes duplicate
//! work idempotent: every write is preceded by a canonical comparison.
//!
//! ## Events and queues
//! Reconcilers never call each other. When a change in one namespace makes
//! another namespace stale (a moved parent, a changed source, a critical
//! condition appearing), the namespace is flagged on the affected bus, an
//! unbounded channel whose producers never block and may therefore fire
//! under the forest lock. A forwarder drains the bus into the hierarchy
//! work queue. Work queues hold one slot per item, so event bursts collapse
//! into single reconciliations, and failed items re-enter with exponential
//! backoff.
//!
//! ## Locking order
//! Two locks exist: the per-namespace serialization lock and the forest
//! mutex, taken strictly in that order. Nothing blocks while the forest
//! mutex is held.
#![warn(missing_docs)]
/// Cluster adapter trait and its error taxonomy.
pub mod api;
/// Condition codes, keys and flattening.
pub mod condition;
/// The in-memory forest.
pub mod forest;
/// The hierarchy reconciler.
pub mod hierarchy;
/// In-memory cluster for tests and local runs.
pub mod mem;
/// Counters and gauges.
pub mod metrics;
/// The opaque object model and canonical form.
pub mod object;
/// Forest-versus-cluster drift scans.
pub mod patrol;
/// The per-kind object reconciler.
pub mod propagate;
#[cfg(test)]
mod props;
/// Work queues, per-namespace locks and the affected bus.
pub mod queue;
/// Hierarchy records and namespace metadata.
pub mod record;
/// Admission-time validators.
pub mod validators;

pub use crate::api::{ApiError, Cluster, WatchEvent};
pub use crate::condition::{AffectedObject, Code, Condition, ConditionKey};
pub use crate::forest::{shared, Forest, Node, Relatives, SharedForest, SourceLookup};
pub use crate::hierarchy::HierarchyReconciler;
pub use crate::mem::MemCluster;
pub use crate::metrics::{Metrics, Snapshot};
pub use crate::object::{
    depth_label, is_depth_label, is_meta_key, object_key, Canonical, Gvk, Object, INHERITED_FROM,
    META_GROUP, MODIFIED_ANNOTATION,
};
pub use crate::patrol::Drift;
pub use crate::propagate::{ObjectReconciler, ObjectRef};
pub use crate::queue::{Affected, AffectedEvent, NsLocks, WorkQueue};
pub use crate::record::{
    record_gvk, HierarchyRecord, HierarchySpec, HierarchyStatus, NamespaceMeta, RECORD_NAME,
};
pub use crate::validators::{
    enforced_kinds, validate_config, validate_hierarchy, validate_namespace_delete,
    validate_object, ResourceRule, SyncConfig, SyncMode,
};
