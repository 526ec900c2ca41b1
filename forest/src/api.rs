use crate::object::{Gvk, Object};
use crate::record::{HierarchyRecord, NamespaceMeta};
use async_trait::async_trait;
use futures::channel::mpsc;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by the cluster adapter. `Transient` and `Conflict`
/// requeue the work item with backoff; everything else is handled in place.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The object does not exist. Normal on reads; a write falls back to a
    /// create.
    #[error("not found")]
    NotFound,
    /// The object already exists under another identity.
    #[error("already exists with uid {uid}")]
    AlreadyExists {
        /// Identity delegated to the existing object.
        uid: u64,
    },
    /// The write raced with another writer.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The cluster was unreachable or overloaded.
    #[error("transient: {0}")]
    Transient(String),
    /// The request can never succeed as issued.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ApiError {
    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_) | ApiError::Conflict(_))
    }
}

/// One observed change, routed into the reconciler work queues.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum WatchEvent {
    /// A namespace appeared, changed or disappeared.
    Namespace(String),
    /// A hierarchy record changed in a namespace.
    Hierarchy(String),
    /// An object of a kind changed in a namespace.
    Object(Gvk, String, String),
}

/// The thin adapter the engine consumes to talk to the orchestrator.
/// Implementations must be safe to call concurrently; the engine never holds
/// the forest lock across any of these calls.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetches namespace metadata; `None` when the namespace is gone.
    async fn namespace(&self, name: &str) -> Result<Option<NamespaceMeta>, ApiError>;

    /// Lists all namespaces.
    async fn list_namespaces(&self) -> Result<Vec<NamespaceMeta>, ApiError>;

    /// Creates a namespace.
    async fn create_namespace(&self, name: &str) -> Result<(), ApiError>;

    /// Replaces the labels of a namespace.
    async fn update_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), ApiError>;

    /// Fetches the hierarchy record of a namespace.
    async fn hierarchy(&self, namespace: &str) -> Result<Option<HierarchyRecord>, ApiError>;

    /// Creates or replaces a hierarchy record.
    async fn put_hierarchy(&self, record: HierarchyRecord) -> Result<(), ApiError>;

    /// Fetches an object; `None` when it is gone.
    async fn object(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Object>, ApiError>;

    /// Lists the objects of a kind in a namespace.
    async fn list_objects(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Object>, ApiError>;

    /// Creates an object; fails with `AlreadyExists` when named identically
    /// to a live object.
    async fn create_object(&self, object: Object) -> Result<(), ApiError>;

    /// Updates an object in place; fails with `NotFound` when it is gone.
    async fn update_object(&self, object: Object) -> Result<(), ApiError>;

    /// Deletes an object; fails with `NotFound` when it is already gone.
    async fn delete_object(&self, gvk: &Gvk, namespace: &str, name: &str)
        -> Result<(), ApiError>;

    /// Subscribes to change notifications.
    fn watch(&self) -> mpsc::UnboundedReceiver<WatchEvent>;
}
