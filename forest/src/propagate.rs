use crate::api::{ApiError, Cluster};
use crate::condition::{Code, ConditionKey};
use crate::forest::{Forest, SharedForest, SourceLookup};
use crate::metrics::Metrics;
use crate::object::{Gvk, Object, MODIFIED_ANNOTATION};
use crate::queue::{Affected, WorkQueue};
use crate::validators::SyncMode;
use fnv::FnvHashSet;
use std::sync::Arc;
use tracing::Instrument;

/// One object due for reconciliation.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectRef {
    /// Namespace holding (or expected to hold) the object.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

enum Action {
    Ignore,
    Delete,
    Write(Object),
}

struct Decision {
    action: Action,
    /// `Some(flag)` asks the act phase to flip the legacy modified
    /// annotation. Detected under the forest lock, written outside it.
    annotate: Option<bool>,
}

impl Decision {
    fn ignore() -> Self {
        Self {
            action: Action::Ignore,
            annotate: None,
        }
    }
}

/// Reconciles objects of one kind: classifies each as source or propagated
/// copy under the forest lock, then creates, overwrites or deletes copies
/// without it. Condition changes flag the owning namespaces on the affected
/// bus so their records pick them up.
pub struct ObjectReconciler {
    gvk: Gvk,
    mode: SyncMode,
    forest: SharedForest,
    cluster: Arc<dyn Cluster>,
    queue: WorkQueue<ObjectRef>,
    affected: Affected,
    metrics: Arc<Metrics>,
    excluded: Arc<FnvHashSet<String>>,
    protect_overrides: bool,
}

impl ObjectReconciler {
    /// Builds the reconciler for a kind.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gvk: Gvk,
        mode: SyncMode,
        forest: SharedForest,
        cluster: Arc<dyn Cluster>,
        affected: Affected,
        metrics: Arc<Metrics>,
        excluded: Arc<FnvHashSet<String>>,
        protect_overrides: bool,
    ) -> Self {
        Self {
            gvk,
            mode,
            forest,
            cluster,
            queue: WorkQueue::new(),
            affected,
            metrics,
            excluded,
            protect_overrides,
        }
    }

    /// The kind this reconciler owns.
    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    /// The reconciler's work queue.
    pub fn queue(&self) -> &WorkQueue<ObjectRef> {
        &self.queue
    }

    /// Flags one object for reconciliation.
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.queue.enqueue(ObjectRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    /// Flags everything of this kind in a namespace: objects present there,
    /// and one item per ancestor-sourced name, so stale copies and newly
    /// visible sources are both processed.
    pub async fn sync_namespace(&self, namespace: &str) -> Result<(), ApiError> {
        if self.excluded.contains(namespace) {
            return Ok(());
        }
        for object in self.cluster.list_objects(&self.gvk, namespace).await? {
            self.enqueue(namespace, &object.name);
        }
        let expected = {
            let forest = self.forest.lock();
            forest.expected_propagated(namespace, &self.gvk)
        };
        for (_, name) in expected {
            self.enqueue(namespace, &name);
        }
        Ok(())
    }

    /// Reconciles one object.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        if self.excluded.contains(namespace) {
            return Ok(());
        }
        {
            let forest = self.forest.lock();
            if !forest.exists(namespace) || forest.propagation_halted(namespace) {
                return Ok(());
            }
        }
        let span = tracing::debug_span!("object", kind = %self.gvk, ns = %namespace, name = %name);
        async move {
            let _running = self.metrics.inflight();
            self.metrics.object_reconcile();

            let object = self.cluster.object(&self.gvk, namespace, name).await?;
            let decision = {
                let mut forest = self.forest.lock();
                self.classify(&mut forest, namespace, name, object.as_ref())
            };
            match decision.action {
                Action::Ignore => {}
                Action::Delete => {
                    tracing::debug!("deleting obsolete copy");
                    match self.cluster.delete_object(&self.gvk, namespace, name).await {
                        Ok(()) => self.metrics.delete(),
                        Err(ApiError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
                Action::Write(desired) => self.write_copy(desired).await?,
            }
            if let Some(modified) = decision.annotate {
                self.annotate_modified(namespace, name, modified).await?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn classify(
        &self,
        forest: &mut Forest,
        namespace: &str,
        name: &str,
        object: Option<&Object>,
    ) -> Decision {
        let here = ConditionKey::object(&self.gvk, namespace, name);
        match object {
            None => {
                if forest.delete_source(namespace, &self.gvk, name) {
                    for descendant in forest.descendants(namespace) {
                        self.enqueue(&descendant, name);
                    }
                }
                forest.clear_synced(namespace, &self.gvk, name);
                if forest.clear_conditions(namespace, &here) {
                    self.affected.enqueue(namespace, "object conditions changed");
                }
                let chain = forest.ancestors(namespace);
                for ancestor in chain.iter().take(chain.len().saturating_sub(1)) {
                    if forest.clear_condition_code(
                        ancestor,
                        &here,
                        Code::ObjectDescendantOverridden,
                    ) {
                        self.affected.enqueue(ancestor, "object conditions changed");
                    }
                }
                if self.mode != SyncMode::Propagate {
                    return Decision::ignore();
                }
                // An absent object with a visible ancestor source is a copy
                // that has not been created yet.
                match forest.ancestor_source(namespace, &self.gvk, name) {
                    SourceLookup::Found { object: source, .. } => Decision {
                        action: Action::Write(source.propagate_to(namespace)),
                        annotate: None,
                    },
                    _ => Decision::ignore(),
                }
            }
            Some(object) if object.is_source() => {
                if self.mode != SyncMode::Propagate {
                    return Decision::ignore();
                }
                if let Some(reason) = object.propagation_blocked() {
                    if forest.delete_source(namespace, &self.gvk, name) {
                        for descendant in forest.descendants(namespace) {
                            self.enqueue(&descendant, name);
                        }
                    }
                    if forest.set_condition(
                        namespace,
                        here,
                        Code::CannotPropagate,
                        reason.to_string(),
                    ) {
                        self.affected.enqueue(namespace, "object conditions changed");
                    }
                    return Decision::ignore();
                }
                if forest.clear_condition_code(namespace, &here, Code::CannotPropagate) {
                    self.affected.enqueue(namespace, "object conditions changed");
                }
                let changed = forest
                    .source(namespace, &self.gvk, name)
                    .map(|stored| stored.canonical() != object.canonical())
                    .unwrap_or(true);
                if changed {
                    forest.set_source(namespace, object.clone());
                    for descendant in forest.descendants(namespace) {
                        self.enqueue(&descendant, name);
                    }
                }
                Decision::ignore()
            }
            Some(copy) => {
                if self.mode == SyncMode::Remove {
                    return Decision {
                        action: Action::Delete,
                        annotate: None,
                    };
                }
                match forest.ancestor_source(namespace, &self.gvk, name) {
                    SourceLookup::None => {
                        forest.clear_synced(namespace, &self.gvk, name);
                        if forest.clear_conditions(namespace, &here) {
                            self.affected.enqueue(namespace, "object conditions changed");
                        }
                        Decision {
                            action: Action::Delete,
                            annotate: None,
                        }
                    }
                    SourceLookup::Paused { .. } => Decision::ignore(),
                    SourceLookup::Found {
                        namespace: source_ns,
                        object: source,
                    } => {
                        if source.canonical() == copy.canonical() {
                            forest.record_synced(namespace, &self.gvk, name, copy.canonical());
                            let mut annotate = None;
                            if forest.clear_condition_code(namespace, &here, Code::ObjectOverridden)
                            {
                                forest.clear_condition_code(
                                    &source_ns,
                                    &here,
                                    Code::ObjectDescendantOverridden,
                                );
                                self.affected.enqueue(namespace, "object conditions changed");
                                self.affected.enqueue(&source_ns, "object conditions changed");
                                // The pause below this namespace is lifted.
                                for descendant in forest.descendants(namespace) {
                                    self.enqueue(&descendant, name);
                                }
                                annotate = Some(false);
                            }
                            if copy.inherited_from() != Some(source_ns.as_str()) {
                                // Content matches but provenance is stale,
                                // e.g. the nearest source moved.
                                return Decision {
                                    action: Action::Write(source.propagate_to(namespace)),
                                    annotate,
                                };
                            }
                            Decision {
                                action: Action::Ignore,
                                annotate,
                            }
                        } else if self.protect_overrides
                            && forest.synced(namespace, &self.gvk, name) != Some(&copy.canonical())
                        {
                            // The copy diverges from the source and from the
                            // form it last agreed on, so a user edited it. A
                            // copy equal to its last agreed form is merely
                            // stale and falls through to the overwrite.
                            let marked = forest.set_condition(
                                namespace,
                                here.clone(),
                                Code::ObjectOverridden,
                                format!("copy of {} from {} was modified locally", name, source_ns),
                            );
                            let paired = forest.set_condition(
                                &source_ns,
                                here,
                                Code::ObjectDescendantOverridden,
                                format!("copy of {} in {} was modified", name, namespace),
                            );
                            if marked {
                                self.affected.enqueue(namespace, "object conditions changed");
                            }
                            if paired {
                                self.affected.enqueue(&source_ns, "object conditions changed");
                            }
                            Decision {
                                action: Action::Ignore,
                                annotate: Some(true),
                            }
                        } else {
                            self.metrics.overwrite();
                            Decision {
                                action: Action::Write(source.propagate_to(namespace)),
                                annotate: None,
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write_copy(&self, desired: Object) -> Result<(), ApiError> {
        match self.cluster.update_object(desired.clone()).await {
            Ok(()) => {
                self.metrics.write();
                self.mark_synced(&desired);
                Ok(())
            }
            Err(ApiError::NotFound) => match self.cluster.create_object(desired.clone()).await {
                Ok(()) => {
                    self.metrics.write();
                    self.mark_synced(&desired);
                    Ok(())
                }
                Err(ApiError::AlreadyExists { .. }) => {
                    // Lost a create race; equal content is a success.
                    let existing = self
                        .cluster
                        .object(&desired.gvk, &desired.namespace, &desired.name)
                        .await?;
                    if existing.map(|o| o.canonical()) == Some(desired.canonical()) {
                        self.mark_synced(&desired);
                        Ok(())
                    } else {
                        self.cannot_update(&desired, "an object with another identity is in the way");
                        Ok(())
                    }
                }
                Err(err) if err.is_transient() => Err(err),
                Err(err) => {
                    self.cannot_update(&desired, &err.to_string());
                    Ok(())
                }
            },
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                self.cannot_update(&desired, &err.to_string());
                Ok(())
            }
        }
    }

    fn mark_synced(&self, written: &Object) {
        self.forest.lock().record_synced(
            &written.namespace,
            &written.gvk,
            &written.name,
            written.canonical(),
        );
    }

    fn cannot_update(&self, desired: &Object, message: &str) {
        let changed = {
            let mut forest = self.forest.lock();
            forest.set_condition(
                &desired.namespace,
                ConditionKey::object(&desired.gvk, &desired.namespace, &desired.name),
                Code::CannotUpdate,
                message.to_string(),
            )
        };
        if changed {
            self.affected
                .enqueue(&desired.namespace, "object conditions changed");
        }
    }

    async fn annotate_modified(
        &self,
        namespace: &str,
        name: &str,
        modified: bool,
    ) -> Result<(), ApiError> {
        let mut object = match self.cluster.object(&self.gvk, namespace, name).await? {
            Some(object) => object,
            None => return Ok(()),
        };
        let marked = object
            .annotations
            .get(MODIFIED_ANNOTATION)
            .map(|value| value == "true")
            .unwrap_or(false);
        if marked == modified {
            return Ok(());
        }
        if modified {
            object
                .annotations
                .insert(MODIFIED_ANNOTATION.into(), "true".into());
        } else {
            object.annotations.remove(MODIFIED_ANNOTATION);
        }
        match self.cluster.update_object(object).await {
            Ok(()) => self.metrics.write(),
            Err(ApiError::NotFound) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }
}
