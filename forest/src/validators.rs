use crate::forest::{Forest, SourceLookup};
use crate::object::{Gvk, Object};
use crate::record::HierarchySpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a tracked kind is synchronized across the forest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Sources propagate into descendants.
    Propagate,
    /// Propagated copies are deleted; sources are left alone.
    Remove,
    /// The kind is not touched at all.
    Ignore,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Propagate
    }
}

/// One tracked kind and its mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Kind key.
    pub gvk: Gvk,
    /// Synchronization mode.
    #[serde(default)]
    pub mode: SyncMode,
}

/// The cluster-wide resource configuration gated by the config validator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tracked kinds.
    pub resources: Vec<ResourceRule>,
}

/// Kinds whose propagation the controller enforces unconditionally; a
/// configuration declaring them user-managed is both redundant and
/// contradictory.
pub fn enforced_kinds() -> Vec<Gvk> {
    vec![
        Gvk::new("rbac.authorization.k8s.io", "v1", "Role"),
        Gvk::new("rbac.authorization.k8s.io", "v1", "RoleBinding"),
    ]
}

/// Gates writes to a hierarchy record. Runs against a read-only snapshot of
/// the forest and never mutates it.
pub fn validate_hierarchy(
    forest: &Forest,
    namespace: &str,
    proposed: &HierarchySpec,
) -> Result<(), String> {
    if !proposed.parent.is_empty() {
        forest.can_set_parent(namespace, Some(proposed.parent.as_str()))?;
        if let Some(claimer) = forest.required_child_of(namespace) {
            if proposed.parent != claimer {
                return Err(format!(
                    "{} is a required child of {} and cannot be parented to {}",
                    namespace, claimer, proposed.parent
                ));
            }
        }
    }
    let mut seen = BTreeSet::new();
    for child in &proposed.required_children {
        if child.as_str() == namespace {
            return Err(format!("{} cannot require itself as a child", namespace));
        }
        if !seen.insert(child.as_str()) {
            return Err(format!("required child {} is declared twice", child));
        }
        if let Some(claimer) = forest.required_child_of(child) {
            if claimer != namespace {
                return Err(format!(
                    "{} is already a required child of {}",
                    child, claimer
                ));
            }
        }
        if forest.exists(child) {
            let parent = forest.parent(child);
            if parent != Some(namespace) {
                return Err(format!(
                    "required child {} is parented to {}",
                    child,
                    parent.unwrap_or("no namespace")
                ));
            }
        }
    }
    Ok(())
}

/// Gates namespace deletion: a namespace still claiming required children
/// goes away only when its record allows the deletion to cascade.
pub fn validate_namespace_delete(forest: &Forest, namespace: &str) -> Result<(), String> {
    let claimed = forest.claimed_children(namespace);
    if !claimed.is_empty() && !forest.allows_cascade(namespace) {
        return Err(format!(
            "{} still requires children ({}) and does not allow cascading deletion",
            namespace,
            claimed.join(", ")
        ));
    }
    Ok(())
}

/// Gates the cluster-wide resource configuration.
pub fn validate_config(known: &[Gvk], config: &SyncConfig) -> Result<(), String> {
    let enforced = enforced_kinds();
    let mut seen = BTreeSet::new();
    for rule in &config.resources {
        if !seen.insert(rule.gvk.clone()) {
            return Err(format!("{} is declared twice", rule.gvk));
        }
        if !known.contains(&rule.gvk) {
            return Err(format!("{} is not a resource this cluster serves", rule.gvk));
        }
        if enforced.contains(&rule.gvk) && rule.mode != SyncMode::Propagate {
            return Err(format!(
                "{} is enforced and cannot be declared user-managed",
                rule.gvk
            ));
        }
    }
    Ok(())
}

/// Gates a direct object write: a new source may not collide with a source
/// of the same kind and name above or below it, and a copy may not claim
/// provenance no ancestor provides.
pub fn validate_object(forest: &Forest, object: &Object) -> Result<(), String> {
    match object.inherited_from() {
        None => {
            let chain = forest.ancestors(&object.namespace);
            for ancestor in chain.iter().take(chain.len().saturating_sub(1)) {
                if forest.source(ancestor, &object.gvk, &object.name).is_some() {
                    return Err(format!(
                        "{} would conflict with the object of the same name propagated from {}",
                        object.name, ancestor
                    ));
                }
            }
            for descendant in forest.descendants(&object.namespace) {
                if forest
                    .source(&descendant, &object.gvk, &object.name)
                    .is_some()
                {
                    return Err(format!(
                        "{} would overwrite the object of the same name defined in {}",
                        object.name, descendant
                    ));
                }
            }
            Ok(())
        }
        Some(claimed) => match forest.ancestor_source(&object.namespace, &object.gvk, &object.name)
        {
            SourceLookup::Found { namespace, .. } if namespace == claimed => Ok(()),
            _ => Err(format!(
                "{} claims inheritance from {} but no such source is visible",
                object.name, claimed
            )),
        },
    }
}
