use crate::api::{ApiError, Cluster};
use crate::condition::{AffectedObject, Code, Condition, ConditionKey};
use crate::forest::{Forest, SharedForest};
use crate::metrics::Metrics;
use crate::object::{depth_label, is_depth_label};
use crate::propagate::ObjectReconciler;
use crate::queue::{Affected, NsLocks};
use crate::record::{record_gvk, HierarchyRecord, HierarchyStatus, NamespaceMeta, RECORD_NAME};
use fnv::FnvHashSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

/// Reconciles one namespace's hierarchy record against the forest and writes
/// back spec, status and tree-depth labels. The forest-mutating decision runs
/// under the forest lock; API calls never do.
pub struct HierarchyReconciler {
    forest: SharedForest,
    cluster: Arc<dyn Cluster>,
    locks: Arc<NsLocks>,
    affected: Affected,
    objects: Vec<Arc<ObjectReconciler>>,
    metrics: Arc<Metrics>,
    excluded: Arc<FnvHashSet<String>>,
}

#[derive(Debug, Default)]
struct Decision {
    create_namespace: bool,
    write_record: Option<HierarchyRecord>,
    write_labels: Option<BTreeMap<String, String>>,
    sync_objects: bool,
}

impl HierarchyReconciler {
    /// Builds the reconciler over a forest and the registered per-kind
    /// object reconcilers.
    pub fn new(
        forest: SharedForest,
        cluster: Arc<dyn Cluster>,
        locks: Arc<NsLocks>,
        affected: Affected,
        objects: Vec<Arc<ObjectReconciler>>,
        metrics: Arc<Metrics>,
        excluded: Arc<FnvHashSet<String>>,
    ) -> Self {
        Self {
            forest,
            cluster,
            locks,
            affected,
            objects,
            metrics,
            excluded,
        }
    }

    /// Reconciles a namespace. Reconciliations of the same namespace are
    /// serialized by the per-name lock; the correlation id ties log lines of
    /// one pass together.
    pub async fn reconcile(&self, namespace: &str) -> Result<(), ApiError> {
        if self.excluded.contains(namespace) {
            return Ok(());
        }
        let (lock, seq) = self.locks.handle(namespace);
        let span = tracing::debug_span!("hierarchy", ns = %namespace, seq);
        async move {
            let _serial = lock.lock().await;
            let _running = self.metrics.inflight();
            self.metrics.hierarchy_reconcile();

            let record = self.cluster.hierarchy(namespace).await?;
            let meta = self.cluster.namespace(namespace).await?;

            let decision = {
                let mut forest = self.forest.lock();
                self.evaluate(&mut forest, namespace, record, meta)
            };

            if decision.create_namespace {
                tracing::info!("creating required child namespace");
                self.cluster.create_namespace(namespace).await?;
                self.metrics.write();
            }
            if let Some(desired) = decision.write_record {
                tracing::debug!("writing hierarchy record");
                self.cluster.put_hierarchy(desired).await?;
                self.metrics.write();
            }
            if let Some(labels) = decision.write_labels {
                tracing::debug!("refreshing tree labels");
                match self.cluster.update_namespace_labels(namespace, labels).await {
                    Ok(()) => self.metrics.write(),
                    // The namespace vanished mid-flight; its deletion event
                    // will reconcile the forest.
                    Err(ApiError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            if decision.sync_objects {
                for reconciler in &self.objects {
                    reconciler.sync_namespace(namespace).await?;
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn evaluate(
        &self,
        forest: &mut Forest,
        namespace: &str,
        record: Option<HierarchyRecord>,
        meta: Option<NamespaceMeta>,
    ) -> Decision {
        let meta = match meta {
            Some(meta) => meta,
            None => return self.evaluate_missing(forest, namespace),
        };

        let record_deleting = record.as_ref().map(|r| r.deleting).unwrap_or(false);
        let suppress = meta.deleting && (record.is_none() || record_deleting);
        let crit_before = forest.has_crit(namespace);

        // The first observation wakes up everything already pointing here:
        // stale children, a claimed parent, a claiming namespace.
        if forest.set_exists(namespace) {
            if let Some(parent) = forest.parent(namespace).map(str::to_string) {
                self.affected.enqueue(&parent, "namespace first observed");
            }
            for child in forest.children(namespace) {
                self.affected.enqueue(&child, "namespace first observed");
            }
            if let Some(claimer) = forest.required_child_of(namespace).map(str::to_string) {
                self.affected.enqueue(&claimer, "required child observed");
            }
        }

        // Critical conditions are recomputed from scratch each tick. The
        // snapshot gates the wake-ups: re-deriving the same condition does
        // not re-enqueue its relatives, or two conflicted namespaces would
        // reconcile each other forever.
        let known_crit = forest.crit_entries(namespace);
        forest.clear_crit_conditions(namespace);

        let mut spec = record.as_ref().map(|r| r.spec.clone()).unwrap_or_default();
        forest.set_cascade(namespace, spec.allow_cascading_delete);

        if let Some(claimer) = forest.required_child_of(namespace).map(str::to_string) {
            if spec.parent.is_empty() {
                spec.parent = claimer;
            } else if spec.parent != claimer {
                let key = ConditionKey::object(&record_gvk(), &claimer, RECORD_NAME);
                let message = format!(
                    "claimed as a required child of {} but declares parent {}",
                    claimer, spec.parent
                );
                let fresh = !known_crit.contains(&(
                    key.clone(),
                    Code::CritRequiredChildConflict,
                    message.clone(),
                ));
                forest.set_condition(
                    namespace,
                    key,
                    Code::CritRequiredChildConflict,
                    message,
                );
                if fresh {
                    self.affected.enqueue(&claimer, "required-child conflict");
                    self.affected.enqueue(&spec.parent, "required-child conflict");
                }
            }
        }

        let old_parent = forest.parent(namespace).map(str::to_string);
        if spec.parent.is_empty() {
            forest
                .set_parent(namespace, None)
                .expect("clearing a parent cannot form a cycle");
        } else {
            if !forest.exists(&spec.parent) {
                forest.ensure(&spec.parent);
                forest.set_condition(
                    namespace,
                    ConditionKey::Local,
                    Code::CritParentMissing,
                    format!("parent {} does not exist", spec.parent),
                );
            }
            if let Err(reason) = forest.set_parent(namespace, Some(spec.parent.as_str())) {
                forest.set_condition(
                    namespace,
                    ConditionKey::Local,
                    Code::CritParentInvalid,
                    reason,
                );
            }
        }
        let new_parent = forest.parent(namespace).map(str::to_string);
        if old_parent != new_parent {
            if let Some(parent) = &old_parent {
                self.affected.enqueue(parent, "former parent of a moved namespace");
            }
            if let Some(parent) = &new_parent {
                self.affected.enqueue(parent, "new parent of a moved namespace");
            }
            for descendant in forest.descendants(namespace) {
                self.affected.enqueue(&descendant, "ancestor chain changed");
            }
        }

        self.reconcile_required_children(forest, namespace, &spec.required_children, &known_crit);

        let crit_here = forest.has_crit(namespace);
        let crit_ancestor = forest.crit_ancestor(namespace);

        // Depth labels are not emitted while any critical condition is
        // present; the next healthy pass replaces the whole set.
        let write_labels = if crit_here || crit_ancestor.is_some() {
            None
        } else {
            let mut labels: BTreeMap<String, String> = meta
                .labels
                .iter()
                .filter(|(key, _)| !is_depth_label(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let chain = forest.ancestors(namespace);
            for (distance, ancestor) in chain.iter().rev().enumerate() {
                labels.insert(depth_label(ancestor), distance.to_string());
            }
            if labels != meta.labels {
                Some(labels)
            } else {
                None
            }
        };

        let mut conditions = forest.flattened_conditions(namespace);
        if let Some(ancestor) = &crit_ancestor {
            let gvk = record_gvk();
            conditions.push(Condition {
                code: Code::CritAncestor,
                message: format!("ancestor {} carries a critical condition", ancestor),
                affects: vec![AffectedObject {
                    group: gvk.group,
                    version: gvk.version,
                    kind: gvk.kind,
                    namespace: ancestor.clone(),
                    name: RECORD_NAME.into(),
                }],
            });
        }

        let desired = HierarchyRecord {
            namespace: namespace.to_string(),
            spec,
            status: HierarchyStatus {
                children: forest.children(namespace),
                conditions,
            },
            deleting: record_deleting,
        };
        let write_record = if suppress {
            None
        } else {
            match &record {
                None => Some(desired),
                Some(existing) if existing != &desired => Some(desired),
                Some(_) => None,
            }
        };

        let crit_after = forest.has_crit(namespace);
        if crit_before != crit_after {
            let reason = if crit_after {
                "ancestor crit added"
            } else {
                "ancestor crit removed"
            };
            for descendant in forest.descendants(namespace) {
                self.affected.enqueue(&descendant, reason);
            }
        }

        Decision {
            create_namespace: false,
            write_record,
            write_labels: if suppress { None } else { write_labels },
            sync_objects: !suppress,
        }
    }

    fn evaluate_missing(&self, forest: &mut Forest, namespace: &str) -> Decision {
        // A claimed required child is recreated instead of torn down.
        if let Some(claimer) = forest.required_child_of(namespace).map(str::to_string) {
            let mut desired = HierarchyRecord::new(namespace);
            desired.spec.parent = claimer;
            return Decision {
                create_namespace: true,
                write_record: Some(desired),
                write_labels: None,
                sync_objects: false,
            };
        }
        let relatives = forest.remove_namespace(namespace);
        if let Some(parent) = relatives.parent {
            self.affected.enqueue(&parent, "child namespace deleted");
        }
        for child in relatives.children {
            self.affected.enqueue(&child, "parent namespace deleted");
        }
        Decision::default()
    }

    fn reconcile_required_children(
        &self,
        forest: &mut Forest,
        namespace: &str,
        required_children: &[String],
        known_crit: &std::collections::BTreeSet<(ConditionKey, Code, String)>,
    ) {
        let claimed_before = forest.claimed_children(namespace);
        let mut declared: Vec<String> = required_children.to_vec();
        declared.sort();
        declared.dedup();

        for required in &declared {
            if required.as_str() == namespace {
                forest.set_condition(
                    namespace,
                    ConditionKey::object(&record_gvk(), namespace, RECORD_NAME),
                    Code::CritRequiredChildConflict,
                    format!("{} cannot be its own required child", namespace),
                );
                continue;
            }
            let newly_claimed = forest.required_child_of(required) != Some(namespace);
            forest.set_required_child_of(required, namespace);
            if !forest.exists(required) {
                if newly_claimed {
                    self.affected.enqueue(required, "required child missing");
                }
            } else {
                let actual = forest.parent(required).map(str::to_string);
                if actual.as_deref() != Some(namespace) {
                    let key = ConditionKey::object(&record_gvk(), required, RECORD_NAME);
                    let message = format!(
                        "required child {} is parented to {}",
                        required,
                        actual.as_deref().unwrap_or("no namespace")
                    );
                    let fresh = !known_crit.contains(&(
                        key.clone(),
                        Code::CritRequiredChildConflict,
                        message.clone(),
                    ));
                    forest.set_condition(
                        namespace,
                        key,
                        Code::CritRequiredChildConflict,
                        message,
                    );
                    if fresh || newly_claimed {
                        self.affected.enqueue(required, "required-child conflict");
                    }
                }
            }
        }

        for stale in claimed_before {
            if !declared.contains(&stale) {
                forest.release_required_child(&stale);
                self.affected.enqueue(&stale, "required-child claim released");
            }
        }

        for child in forest.children(namespace) {
            if let Some(claimer) = forest.required_child_of(&child).map(str::to_string) {
                if claimer != namespace {
                    forest.set_condition(
                        namespace,
                        ConditionKey::object(&record_gvk(), &child, RECORD_NAME),
                        Code::CritRequiredChildConflict,
                        format!("child {} is claimed as a required child of {}", child, claimer),
                    );
                }
            }
        }
    }
}
