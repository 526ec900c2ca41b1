use crate::api::{ApiError, Cluster};
use crate::forest::SharedForest;
use crate::object::{is_depth_label, depth_label, Gvk};
use fnv::FnvHashSet;
use std::collections::{BTreeMap, BTreeSet};

/// Divergence between the forest and the cluster found by one patrol pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Drift {
    /// Namespaces the cluster serves that the forest does not track yet.
    pub missing_nodes: u64,
    /// Namespaces the forest tracks that the cluster no longer serves.
    pub stale_nodes: u64,
    /// Namespaces whose depth labels diverge from the forest's view.
    pub label_drift: u64,
    /// Propagated copies that should exist but do not.
    pub missing_copies: u64,
    /// Labelled copies present without a backing source.
    pub obsolete_copies: u64,
}

impl Drift {
    /// Total drift found.
    pub fn total(&self) -> u64 {
        self.missing_nodes
            + self.stale_nodes
            + self.label_drift
            + self.missing_copies
            + self.obsolete_copies
    }
}

struct Expectation {
    namespace: String,
    labels: BTreeMap<String, String>,
    copies: Vec<(Gvk, BTreeSet<String>)>,
}

/// Compares forest state against the cluster and counts the drift. The scan
/// snapshots its expectations under one short forest lock and performs all
/// list calls without it; it never mutates either side.
pub async fn scan(
    forest: &SharedForest,
    cluster: &dyn Cluster,
    kinds: &[Gvk],
    excluded: &FnvHashSet<String>,
) -> Result<Drift, ApiError> {
    let namespaces = cluster.list_namespaces().await?;
    let mut drift = Drift::default();

    let (known, expectations) = {
        let forest = forest.lock();
        let known: BTreeSet<String> = forest.existing().into_iter().collect();
        let mut expectations = Vec::new();
        for meta in &namespaces {
            if excluded.contains(&meta.name) || !forest.exists(&meta.name) {
                continue;
            }
            // Halted subtrees are expected to be stale until the critical
            // condition clears; comparing them would only count noise.
            if forest.propagation_halted(&meta.name) {
                continue;
            }
            let mut labels: BTreeMap<String, String> = meta
                .labels
                .iter()
                .filter(|(key, _)| !is_depth_label(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let chain = forest.ancestors(&meta.name);
            for (distance, ancestor) in chain.iter().rev().enumerate() {
                labels.insert(depth_label(ancestor), distance.to_string());
            }
            let copies = kinds
                .iter()
                .map(|gvk| {
                    let expected: BTreeSet<String> = forest
                        .expected_propagated(&meta.name, gvk)
                        .into_iter()
                        .map(|(_, name)| name)
                        .collect();
                    (gvk.clone(), expected)
                })
                .collect();
            expectations.push(Expectation {
                namespace: meta.name.clone(),
                labels,
                copies,
            });
        }
        (known, expectations)
    };

    let served: BTreeSet<&str> = namespaces.iter().map(|meta| meta.name.as_str()).collect();
    for meta in &namespaces {
        if !excluded.contains(&meta.name) && !known.contains(&meta.name) {
            drift.missing_nodes += 1;
        }
    }
    for name in &known {
        if !served.contains(name.as_str()) {
            drift.stale_nodes += 1;
        }
    }

    for expectation in expectations {
        let actual = namespaces
            .iter()
            .find(|meta| meta.name == expectation.namespace)
            .map(|meta| &meta.labels);
        if actual != Some(&expectation.labels) {
            drift.label_drift += 1;
        }
        for (gvk, expected) in &expectation.copies {
            let actual: BTreeSet<String> = cluster
                .list_objects(gvk, &expectation.namespace)
                .await?
                .into_iter()
                .filter(|object| !object.is_source())
                .map(|object| object.name)
                .collect();
            drift.missing_copies += expected.difference(&actual).count() as u64;
            drift.obsolete_copies += actual.difference(expected).count() as u64;
        }
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest;
    use crate::mem::MemCluster;
    use crate::object::Object;

    #[async_std::test]
    async fn quiet_cluster_has_no_drift() -> anyhow::Result<()> {
        let cluster = MemCluster::new();
        let forest = forest::shared();
        cluster.apply_namespace("foo");
        forest.lock().set_exists("foo");
        cluster
            .update_namespace_labels(
                "foo",
                [(depth_label("foo"), "0".to_string())].into_iter().collect(),
            )
            .await?;

        let drift = scan(&forest, &*cluster, &[], &Default::default()).await?;
        assert_eq!(drift, Drift::default());
        Ok(())
    }

    #[async_std::test]
    async fn missing_and_obsolete_copies_are_counted() -> anyhow::Result<()> {
        let cluster = MemCluster::new();
        let forest = forest::shared();
        let gvk = Gvk::core("v1", "Secret");
        cluster.apply_namespace("foo");
        cluster.apply_namespace("bar");
        {
            let mut forest = forest.lock();
            forest.set_exists("foo");
            forest.set_exists("bar");
            forest.set_parent("bar", Some("foo")).unwrap();
            forest.set_source("foo", Object::new(gvk.clone(), "foo", "creds"));
        }
        cluster
            .update_namespace_labels(
                "foo",
                [(depth_label("foo"), "0".to_string())].into_iter().collect(),
            )
            .await?;
        cluster
            .update_namespace_labels(
                "bar",
                [
                    (depth_label("bar"), "0".to_string()),
                    (depth_label("foo"), "1".to_string()),
                ]
                .into_iter()
                .collect(),
            )
            .await?;

        // The copy in bar is missing, and a stray labelled copy lives in foo.
        let stray = Object::new(gvk.clone(), "foo", "stray").propagate_to("foo");
        cluster.apply_object(stray);

        let drift = scan(&forest, &*cluster, &[gvk], &Default::default()).await?;
        assert_eq!(drift.missing_copies, 1);
        assert_eq!(drift.obsolete_copies, 1);
        assert_eq!(drift.label_drift, 0);
        assert_eq!(drift.missing_nodes + drift.stale_nodes, 0);
        Ok(())
    }
}
