use crate::condition::{flatten, Code, Condition, ConditionKey, Entries};
use crate::object::{object_key, Canonical, Gvk, Object};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The forest behind its single coarse mutex. The lock is the only
/// synchronization primitive; it is released before any blocking call.
pub type SharedForest = Arc<Mutex<Forest>>;

/// Creates an empty shared forest.
pub fn shared() -> SharedForest {
    Arc::new(Mutex::new(Forest::default()))
}

/// Relatives of a namespace removed from the forest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Relatives {
    /// Former parent, if any.
    pub parent: Option<String>,
    /// Former children, sorted.
    pub children: Vec<String>,
}

/// Outcome of resolving the source of a propagated copy by walking up the
/// ancestor chain.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceLookup {
    /// No ancestor holds a source; the copy is obsolete.
    None,
    /// An ancestor's own copy is overridden; propagation below it is paused.
    Paused {
        /// Namespace whose copy pauses the subtree.
        at: String,
    },
    /// The nearest ancestor source.
    Found {
        /// Namespace holding the source.
        namespace: String,
        /// Stored source object.
        object: Object,
    },
}

/// One namespace as tracked in the forest, one per distinct name ever
/// observed or referenced. Relationships are held as name indices into the
/// forest map, never as owning pointers.
#[derive(Debug, Default)]
pub struct Node {
    exists: bool,
    parent: Option<String>,
    children: BTreeSet<String>,
    required_child_of: Option<String>,
    allow_cascading_delete: bool,
    conditions: BTreeMap<ConditionKey, Entries>,
    sources: BTreeMap<Gvk, BTreeMap<String, Object>>,
    synced: BTreeMap<Gvk, BTreeMap<String, Canonical>>,
}

impl Node {
    /// True once the cluster has confirmed the namespace.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Parent namespace name, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Namespace that claimed this one as a required child, if any.
    pub fn required_child_of(&self) -> Option<&str> {
        self.required_child_of.as_deref()
    }

    fn has_crit(&self) -> bool {
        self.conditions
            .values()
            .any(|entries| entries.iter().any(|(code, _)| code.is_crit()))
    }

    fn removable(&self) -> bool {
        !self.exists
            && self.parent.is_none()
            && self.children.is_empty()
            && self.conditions.is_empty()
            && self.required_child_of.is_none()
            && self.sources.is_empty()
            && self.synced.is_empty()
    }
}

/// The set of namespace trees. All mutation happens while the caller holds
/// the shared mutex; every method leaves the invariants intact:
/// the parent relation is acyclic, children sets mirror parent indices,
/// and a nonexistent namespace owns no parent edge.
#[derive(Debug, Default)]
pub struct Forest {
    nodes: FnvHashMap<String, Node>,
}

impl Forest {
    /// Looks up a node.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Returns the node for a name, creating it on first reference.
    pub fn ensure(&mut self, name: &str) -> &mut Node {
        self.nodes.entry(name.to_string()).or_default()
    }

    /// True if the namespace is known to exist.
    pub fn exists(&self, name: &str) -> bool {
        self.nodes.get(name).map(|n| n.exists).unwrap_or(false)
    }

    /// Names of all existing namespaces, sorted.
    pub fn existing(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.exists)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Marks a namespace as confirmed by the cluster. Returns true on the
    /// first observation.
    pub fn set_exists(&mut self, name: &str) -> bool {
        let node = self.ensure(name);
        let first = !node.exists;
        node.exists = true;
        first
    }

    /// Tears down a namespace that disappeared from the cluster: the node
    /// loses its parent edge, conditions, sources and claim, and is garbage
    /// collected once nothing references it. Children keep their stale
    /// parent edges until their own reconciliation clears them.
    pub fn remove_namespace(&mut self, name: &str) -> Relatives {
        if !self.nodes.contains_key(name) {
            return Relatives::default();
        }
        let parent = self.parent(name).map(str::to_string);
        let children = self.children(name);
        // A removed namespace owns no relationships.
        self.set_parent(name, None)
            .expect("clearing a parent cannot form a cycle");
        let node = self.ensure(name);
        node.exists = false;
        node.required_child_of = None;
        node.allow_cascading_delete = false;
        node.conditions.clear();
        node.sources.clear();
        node.synced.clear();
        self.gc(name);
        Relatives { parent, children }
    }

    /// Parent of a namespace.
    pub fn parent(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|n| n.parent.as_deref())
    }

    /// Children of a namespace, sorted.
    pub fn children(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The ancestor chain of a namespace, root first, ending with the
    /// namespace itself.
    pub fn ancestors(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut current = name;
        while let Some(parent) = self.parent(current) {
            if chain.iter().any(|seen| seen == parent) {
                break;
            }
            chain.push(parent.to_string());
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// All strict descendants of a namespace, unordered.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = self.children(name);
        while let Some(next) = frontier.pop() {
            frontier.extend(self.children(&next));
            out.push(next);
        }
        out
    }

    /// True if `a` is a strict ancestor of `b`.
    pub fn is_ancestor(&self, a: &str, b: &str) -> bool {
        let mut steps = self.nodes.len() + 1;
        let mut current = b;
        while let Some(parent) = self.parent(current) {
            if parent == a {
                return true;
            }
            current = parent;
            steps -= 1;
            if steps == 0 {
                break;
            }
        }
        false
    }

    /// Checks whether a parent assignment is legal. The error names the
    /// offending ancestor chain for diagnostics.
    pub fn can_set_parent(&self, name: &str, new_parent: Option<&str>) -> Result<(), String> {
        let parent = match new_parent {
            Some(parent) => parent,
            None => return Ok(()),
        };
        if parent == name {
            return Err(format!("{} cannot be its own parent", name));
        }
        if self.is_ancestor(name, parent) {
            let mut chain = vec![parent.to_string()];
            let mut current = parent;
            while let Some(next) = self.parent(current) {
                chain.push(next.to_string());
                if next == name {
                    break;
                }
                current = next;
            }
            return Err(format!(
                "setting the parent of {} to {} would form a cycle: {}",
                name,
                parent,
                chain.join(" <- ")
            ));
        }
        Ok(())
    }

    /// Reassigns the parent of a namespace, maintaining both directions of
    /// the relation and garbage collecting the abandoned parent. Fails only
    /// when the edge would form a cycle; returns the previous parent.
    pub fn set_parent(
        &mut self,
        name: &str,
        new_parent: Option<&str>,
    ) -> Result<Option<String>, String> {
        self.can_set_parent(name, new_parent)?;
        let old = self.ensure(name).parent.clone();
        if old.as_deref() == new_parent {
            return Ok(old);
        }
        if let Some(old_parent) = &old {
            if let Some(node) = self.nodes.get_mut(old_parent) {
                node.children.remove(name);
            }
        }
        match new_parent {
            Some(parent) => {
                self.ensure(parent).children.insert(name.to_string());
                self.ensure(name).parent = Some(parent.to_string());
            }
            None => self.ensure(name).parent = None,
        }
        if let Some(old_parent) = &old {
            self.gc(old_parent);
        }
        Ok(old)
    }

    /// Namespace that claimed this one as a required child.
    pub fn required_child_of(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|n| n.required_child_of.as_deref())
    }

    /// Records a required-child claim.
    pub fn set_required_child_of(&mut self, name: &str, claimer: &str) {
        self.ensure(name).required_child_of = Some(claimer.to_string());
    }

    /// Releases a required-child claim.
    pub fn release_required_child(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.required_child_of = None;
        }
        self.gc(name);
    }

    /// Names claimed as required children of a namespace, sorted.
    pub fn claimed_children(&self, claimer: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.required_child_of.as_deref() == Some(claimer))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Remembers whether the namespace permits cascading deletion.
    pub fn set_cascade(&mut self, name: &str, allow: bool) {
        self.ensure(name).allow_cascading_delete = allow;
    }

    /// True if the namespace permits cascading deletion.
    pub fn allows_cascade(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|n| n.allow_cascading_delete)
            .unwrap_or(false)
    }

    /// Queues a condition under a key, deduplicating identical entries.
    /// Returns true if the condition was not present yet.
    pub fn set_condition(
        &mut self,
        name: &str,
        key: ConditionKey,
        code: Code,
        message: String,
    ) -> bool {
        let entries = self.ensure(name).conditions.entry(key).or_default();
        if entries.iter().any(|(c, m)| *c == code && *m == message) {
            return false;
        }
        entries.push((code, message));
        true
    }

    /// Drops every condition stored under a key. Returns true if any was.
    pub fn clear_conditions(&mut self, name: &str, key: &ConditionKey) -> bool {
        let changed = match self.nodes.get_mut(name) {
            Some(node) => node.conditions.remove(key).is_some(),
            None => false,
        };
        self.gc(name);
        changed
    }

    /// Drops conditions with a given code stored under a key.
    pub fn clear_condition_code(&mut self, name: &str, key: &ConditionKey, code: Code) -> bool {
        let mut changed = false;
        if let Some(node) = self.nodes.get_mut(name) {
            if let Some(entries) = node.conditions.get_mut(key) {
                let before = entries.len();
                entries.retain(|(c, _)| *c != code);
                changed = entries.len() != before;
                if entries.is_empty() {
                    node.conditions.remove(key);
                }
            }
        }
        self.gc(name);
        changed
    }

    /// The critical conditions currently stored on a namespace. A
    /// reconciliation tick snapshots them before recomputing, so relatives
    /// are only woken for conditions that actually appeared.
    pub fn crit_entries(&self, name: &str) -> BTreeSet<(ConditionKey, Code, String)> {
        let mut entries = BTreeSet::new();
        if let Some(node) = self.nodes.get(name) {
            for (key, stored) in &node.conditions {
                for (code, message) in stored {
                    if code.is_crit() {
                        entries.insert((key.clone(), *code, message.clone()));
                    }
                }
            }
        }
        entries
    }

    /// Drops every critical condition on a namespace, so a reconciliation
    /// tick can recompute them from scratch.
    pub fn clear_crit_conditions(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.conditions.retain(|_, entries| {
                entries.retain(|(code, _)| !code.is_crit());
                !entries.is_empty()
            });
        }
        self.gc(name);
    }

    /// True if a condition with the code is stored under the key.
    pub fn has_condition(&self, name: &str, key: &ConditionKey, code: Code) -> bool {
        self.nodes
            .get(name)
            .and_then(|n| n.conditions.get(key))
            .map(|entries| entries.iter().any(|(c, _)| *c == code))
            .unwrap_or(false)
    }

    /// True if the namespace itself carries any critical condition.
    pub fn has_crit(&self, name: &str) -> bool {
        self.nodes.get(name).map(Node::has_crit).unwrap_or(false)
    }

    /// Nearest strict ancestor carrying a critical condition.
    pub fn crit_ancestor(&self, name: &str) -> Option<String> {
        let mut steps = self.nodes.len() + 1;
        let mut current = name;
        while let Some(parent) = self.parent(current) {
            if self.has_crit(parent) {
                return Some(parent.to_string());
            }
            current = parent;
            steps -= 1;
            if steps == 0 {
                break;
            }
        }
        None
    }

    /// True if object propagation into this namespace is halted, either by
    /// its own critical condition or by an ancestor's.
    pub fn propagation_halted(&self, name: &str) -> bool {
        self.has_crit(name) || self.crit_ancestor(name).is_some()
    }

    /// The namespace's conditions pivoted into status records.
    pub fn flattened_conditions(&self, name: &str) -> Vec<Condition> {
        self.nodes
            .get(name)
            .map(|n| flatten(&n.conditions))
            .unwrap_or_default()
    }

    /// Counts, per code, the namespaces currently carrying it.
    pub fn condition_census(&self) -> BTreeMap<Code, u64> {
        let mut census = BTreeMap::new();
        for node in self.nodes.values() {
            let mut codes: BTreeSet<Code> = BTreeSet::new();
            for entries in node.conditions.values() {
                codes.extend(entries.iter().map(|(code, _)| *code));
            }
            for code in codes {
                *census.entry(code).or_default() += 1;
            }
        }
        census
    }

    /// Stores the canonical source copy of an object in its namespace.
    pub fn set_source(&mut self, namespace: &str, object: Object) {
        self.ensure(namespace)
            .sources
            .entry(object.gvk.clone())
            .or_default()
            .insert(object.name.clone(), object);
    }

    /// Looks up a stored source.
    pub fn source(&self, namespace: &str, gvk: &Gvk, name: &str) -> Option<&Object> {
        self.nodes
            .get(namespace)?
            .sources
            .get(gvk)?
            .get(name)
    }

    /// Deletes a stored source. Returns true if it was present.
    pub fn delete_source(&mut self, namespace: &str, gvk: &Gvk, name: &str) -> bool {
        let mut deleted = false;
        if let Some(node) = self.nodes.get_mut(namespace) {
            if let Some(by_name) = node.sources.get_mut(gvk) {
                deleted = by_name.remove(name).is_some();
                if by_name.is_empty() {
                    node.sources.remove(gvk);
                }
            }
        }
        self.gc(namespace);
        deleted
    }

    /// Names of the sources of a kind stored in a namespace, sorted.
    pub fn sources_of(&self, namespace: &str, gvk: &Gvk) -> Vec<String> {
        self.nodes
            .get(namespace)
            .and_then(|n| n.sources.get(gvk))
            .map(|by_name| by_name.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remembers the canonical form a propagated copy last agreed on with
    /// its source, distinguishing stale copies from user-edited ones.
    pub fn record_synced(&mut self, namespace: &str, gvk: &Gvk, name: &str, form: Canonical) {
        self.ensure(namespace)
            .synced
            .entry(gvk.clone())
            .or_default()
            .insert(name.to_string(), form);
    }

    /// The canonical form a copy last agreed on with its source.
    pub fn synced(&self, namespace: &str, gvk: &Gvk, name: &str) -> Option<&Canonical> {
        self.nodes.get(namespace)?.synced.get(gvk)?.get(name)
    }

    /// Forgets the remembered form of a copy.
    pub fn clear_synced(&mut self, namespace: &str, gvk: &Gvk, name: &str) {
        if let Some(node) = self.nodes.get_mut(namespace) {
            if let Some(by_name) = node.synced.get_mut(gvk) {
                by_name.remove(name);
                if by_name.is_empty() {
                    node.synced.remove(gvk);
                }
            }
        }
        self.gc(namespace);
    }

    /// Resolves the source a propagated copy in `namespace` should mirror by
    /// walking the ancestor chain. The walk stops at a namespace whose own
    /// copy of the object is overridden.
    pub fn ancestor_source(&self, namespace: &str, gvk: &Gvk, name: &str) -> SourceLookup {
        let mut steps = self.nodes.len() + 1;
        let mut current = namespace;
        while let Some(ancestor) = self.parent(current) {
            if let Some(object) = self.source(ancestor, gvk, name) {
                return SourceLookup::Found {
                    namespace: ancestor.to_string(),
                    object: object.clone(),
                };
            }
            let key = ConditionKey::Object(object_key(gvk, ancestor, name));
            if self.has_condition(ancestor, &key, Code::ObjectOverridden) {
                return SourceLookup::Paused {
                    at: ancestor.to_string(),
                };
            }
            current = ancestor;
            steps -= 1;
            if steps == 0 {
                break;
            }
        }
        SourceLookup::None
    }

    /// Everything a namespace should inherit of a kind: for each name stored
    /// in any strict ancestor, the nearest source wins and paused subtrees
    /// contribute nothing.
    pub fn expected_propagated(&self, namespace: &str, gvk: &Gvk) -> Vec<(String, String)> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        let chain = self.ancestors(namespace);
        for ancestor in chain.iter().take(chain.len().saturating_sub(1)) {
            names.extend(self.sources_of(ancestor, gvk));
        }
        names
            .into_iter()
            .filter_map(|name| match self.ancestor_source(namespace, gvk, &name) {
                SourceLookup::Found {
                    namespace: source_ns,
                    ..
                } => Some((source_ns, name)),
                _ => None,
            })
            .collect()
    }

    /// Removes a node that no longer carries any state or relationship.
    pub fn gc(&mut self, name: &str) {
        if let Some(node) = self.nodes.get(name) {
            if node.removable() {
                self.nodes.remove(name);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (name, node) in &self.nodes {
            if let Some(parent) = &node.parent {
                assert!(
                    node.exists,
                    "{} owns a parent edge while nonexistent",
                    name
                );
                let parent_node = self
                    .nodes
                    .get(parent)
                    .unwrap_or_else(|| panic!("{} points at unknown parent {}", name, parent));
                assert!(
                    parent_node.children.contains(name),
                    "{} missing from children of {}",
                    name,
                    parent
                );
            }
            for child in &node.children {
                assert_eq!(
                    self.parent(child),
                    Some(name.as_str()),
                    "child edge {} -> {} has no matching parent edge",
                    name,
                    child
                );
            }
            let mut steps = self.nodes.len() + 1;
            let mut current = name.as_str();
            while let Some(parent) = self.parent(current) {
                steps -= 1;
                assert!(steps > 0, "cycle through {}", name);
                current = parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    fn observed(forest: &mut Forest, names: &[&str]) {
        for name in names {
            forest.set_exists(name);
        }
    }

    fn chain(forest: &mut Forest, edges: &[(&str, &str)]) {
        for (child, parent) in edges {
            forest.set_parent(child, Some(*parent)).unwrap();
        }
    }

    #[test]
    fn parent_and_children_stay_consistent() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar", "baz"]);
        chain(&mut forest, &[("bar", "foo"), ("baz", "bar")]);

        assert_eq!(forest.children("foo"), vec!["bar"]);
        assert_eq!(forest.ancestors("baz"), vec!["foo", "bar", "baz"]);
        let mut descendants = forest.descendants("foo");
        descendants.sort();
        assert_eq!(descendants, vec!["bar", "baz"]);
        assert!(forest.is_ancestor("foo", "baz"));
        assert!(!forest.is_ancestor("baz", "foo"));
        forest.check_invariants();

        forest.set_parent("baz", Some("foo")).unwrap();
        assert_eq!(forest.children("foo"), vec!["bar", "baz"]);
        assert_eq!(forest.children("bar"), Vec::<String>::new());
        forest.check_invariants();
    }

    #[test]
    fn cycles_are_rejected_with_a_chain() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar"]);
        chain(&mut forest, &[("bar", "foo")]);

        let err = forest.set_parent("foo", Some("bar")).unwrap_err();
        assert!(err.contains("bar <- foo"), "diagnostic was {:?}", err);
        assert_eq!(forest.parent("foo"), None);

        let err = forest.set_parent("foo", Some("foo")).unwrap_err();
        assert!(err.contains("its own parent"));
        forest.check_invariants();
    }

    #[test]
    fn removal_leaves_children_reconcilable() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar", "baz"]);
        chain(&mut forest, &[("bar", "foo"), ("baz", "bar")]);

        let relatives = forest.remove_namespace("bar");
        assert_eq!(relatives.parent.as_deref(), Some("foo"));
        assert_eq!(relatives.children, vec!["baz"]);
        // baz still points at the vanished parent until it reconciles.
        assert_eq!(forest.parent("baz"), Some("bar"));
        assert!(!forest.exists("bar"));

        forest.set_parent("baz", None).unwrap();
        assert!(forest.node("bar").is_none(), "empty node must be collected");
    }

    #[test]
    fn garbage_collection_spares_referenced_nodes() {
        let mut forest = Forest::default();
        forest.set_required_child_of("claimed", "parent");
        forest.gc("claimed");
        assert!(forest.node("claimed").is_some());

        forest.release_required_child("claimed");
        assert!(forest.node("claimed").is_none());
    }

    #[test]
    fn crit_conditions_halt_subtrees() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar", "baz"]);
        chain(&mut forest, &[("bar", "foo"), ("baz", "bar")]);

        forest.set_condition(
            "bar",
            ConditionKey::Local,
            Code::CritParentMissing,
            "parent foo does not exist".into(),
        );
        assert!(forest.has_crit("bar"));
        assert!(!forest.has_crit("baz"));
        assert_eq!(forest.crit_ancestor("baz").as_deref(), Some("bar"));
        assert!(forest.propagation_halted("baz"));
        assert!(!forest.propagation_halted("foo"));

        forest.clear_crit_conditions("bar");
        assert!(!forest.propagation_halted("baz"));
    }

    #[test]
    fn nearest_source_shadows_farther_ones() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar", "baz"]);
        chain(&mut forest, &[("bar", "foo"), ("baz", "bar")]);
        let gvk = Gvk::core("v1", "Secret");

        let mut outer = Object::new(gvk.clone(), "foo", "creds");
        outer.data = serde_json::json!({ "owner": "foo" });
        let mut inner = Object::new(gvk.clone(), "bar", "creds");
        inner.data = serde_json::json!({ "owner": "bar" });
        forest.set_source("foo", outer);
        forest.set_source("bar", inner);

        match forest.ancestor_source("baz", &gvk, "creds") {
            SourceLookup::Found { namespace, object } => {
                assert_eq!(namespace, "bar");
                assert_eq!(object.data["owner"], "bar");
            }
            other => panic!("unexpected lookup {:?}", other),
        }
        assert_eq!(
            forest.expected_propagated("baz", &gvk),
            vec![("bar".to_string(), "creds".to_string())]
        );

        forest.delete_source("bar", &gvk, "creds");
        assert_eq!(
            forest.expected_propagated("baz", &gvk),
            vec![("foo".to_string(), "creds".to_string())]
        );
    }

    #[test]
    fn overridden_copies_pause_the_subtree() {
        let mut forest = Forest::default();
        observed(&mut forest, &["foo", "bar", "baz"]);
        chain(&mut forest, &[("bar", "foo"), ("baz", "bar")]);
        let gvk = Gvk::core("v1", "Secret");
        forest.set_source("foo", Object::new(gvk.clone(), "foo", "creds"));

        let key = ConditionKey::object(&gvk, "bar", "creds");
        forest.set_condition(
            "bar",
            key,
            Code::ObjectOverridden,
            "copy modified locally".into(),
        );

        assert_eq!(
            forest.ancestor_source("baz", &gvk, "creds"),
            SourceLookup::Paused { at: "bar".into() }
        );
        assert!(forest.expected_propagated("baz", &gvk).is_empty());
        // The overridden namespace itself still resolves its source.
        assert!(matches!(
            forest.ancestor_source("bar", &gvk, "creds"),
            SourceLookup::Found { .. }
        ));
    }
}
