use anyhow::Result;
use hns::{
    depth_label, Code, Controller, Gvk, MemCluster, Object, Settings, INHERITED_FROM,
    MODIFIED_ANNOTATION,
};
use serde_json::json;
use std::sync::Arc;

fn secrets() -> Gvk {
    Gvk::core("v1", "Secret")
}

fn secret(namespace: &str, name: &str, owner: &str) -> Object {
    let mut object = Object::new(secrets(), namespace, name);
    object.data = json!({ "type": "Opaque", "owner": owner });
    object
}

fn has_condition(cluster: &MemCluster, namespace: &str, code: Code) -> bool {
    cluster
        .peek_record(namespace)
        .map(|record| record.status.conditions.iter().any(|c| c.code == code))
        .unwrap_or(false)
}

/// Builds namespaces and parent edges, then waits for convergence.
async fn converge(cluster: &Arc<MemCluster>, edges: &[(&str, &str)]) -> Result<Controller> {
    let controller = Controller::start(Settings::default(), cluster.clone()).await?;
    for (child, parent) in edges {
        cluster.edit_hierarchy(child, |spec| spec.parent = (*parent).into());
    }
    controller.quiesce().await;
    Ok(controller)
}

#[async_std::test]
async fn set_parent_updates_children_and_labels() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    cluster.apply_namespace("bar");
    let controller = converge(&cluster, &[("bar", "foo")]).await?;

    let record = cluster.peek_record("foo").unwrap();
    assert_eq!(record.status.children, vec!["bar"]);
    assert!(record.status.conditions.is_empty());

    let labels = cluster.namespace_labels("bar");
    assert_eq!(labels.get(&depth_label("bar")).map(String::as_str), Some("0"));
    assert_eq!(labels.get(&depth_label("foo")).map(String::as_str), Some("1"));
    assert_eq!(
        cluster
            .namespace_labels("foo")
            .get(&depth_label("foo"))
            .map(String::as_str),
        Some("0")
    );

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn cycles_are_refused_and_marked() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    cluster.apply_namespace("bar");
    let controller = converge(&cluster, &[("bar", "foo")]).await?;

    cluster.edit_hierarchy("foo", |spec| spec.parent = "bar".into());
    controller.quiesce().await;

    let record = cluster.peek_record("foo").unwrap();
    let invalid = record
        .status
        .conditions
        .iter()
        .find(|c| c.code == Code::CritParentInvalid)
        .expect("foo must be marked");
    assert!(invalid.message.contains("bar <- foo"), "{}", invalid.message);
    assert_eq!(controller.forest().lock().parent("foo"), None);

    // Descendants carry the synthetic ancestor condition, naming foo.
    let record = cluster.peek_record("bar").unwrap();
    let synthetic = record
        .status
        .conditions
        .iter()
        .find(|c| c.code == Code::CritAncestor)
        .expect("bar must be marked");
    assert_eq!(synthetic.affects[0].namespace, "foo");

    // Dropping the bad edit clears both namespaces.
    cluster.edit_hierarchy("foo", |spec| spec.parent = String::new());
    controller.quiesce().await;
    assert!(!has_condition(&cluster, "foo", Code::CritParentInvalid));
    assert!(!has_condition(&cluster, "bar", Code::CritAncestor));

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn sources_propagate_to_every_descendant() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = converge(&cluster, &[("bar", "foo"), ("baz", "bar")]).await?;

    let source = secret("foo", "foo-sec", "foo");
    cluster.apply_object(source.clone());
    controller.quiesce().await;

    for ns in ["bar", "baz"] {
        let copy = cluster.peek_object(&secrets(), ns, "foo-sec").expect(ns);
        assert_eq!(copy.labels.get(INHERITED_FROM).map(String::as_str), Some("foo"));
        assert_eq!(copy.canonical(), source.canonical());
    }

    // A source edit reaches the copies.
    cluster.apply_object(secret("foo", "foo-sec", "foo-v2"));
    controller.quiesce().await;
    for ns in ["bar", "baz"] {
        let copy = cluster.peek_object(&secrets(), ns, "foo-sec").unwrap();
        assert_eq!(copy.data["owner"], "foo-v2");
    }

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn reparenting_removes_stale_copies() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = converge(&cluster, &[("bar", "foo"), ("baz", "bar")]).await?;

    cluster.apply_object(secret("foo", "foo-sec", "foo"));
    cluster.apply_object(secret("bar", "bar-sec", "bar"));
    controller.quiesce().await;
    assert!(cluster.peek_object(&secrets(), "baz", "bar-sec").is_some());

    cluster.edit_hierarchy("baz", |spec| spec.parent = "foo".into());
    controller.quiesce().await;

    assert!(cluster.peek_object(&secrets(), "baz", "foo-sec").is_some());
    assert!(cluster.peek_object(&secrets(), "baz", "bar-sec").is_none());
    assert!(cluster.peek_object(&secrets(), "bar", "bar-sec").is_some());

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn deleting_a_source_cleans_descendants() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = converge(&cluster, &[("bar", "foo"), ("baz", "bar")]).await?;
    cluster.apply_object(secret("foo", "foo-sec", "foo"));
    controller.quiesce().await;

    cluster.remove_object(&secrets(), "foo", "foo-sec");
    controller.quiesce().await;

    assert!(cluster.peek_object(&secrets(), "bar", "foo-sec").is_none());
    assert!(cluster.peek_object(&secrets(), "baz", "foo-sec").is_none());
    for ns in ["foo", "bar", "baz"] {
        assert!(!has_condition(&cluster, ns, Code::CannotPropagate), "{}", ns);
    }

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn required_child_conflicts_mark_every_party() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "other", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = Controller::start(Settings::default(), cluster.clone()).await?;
    controller.quiesce().await;

    cluster.edit_hierarchy("baz", |spec| spec.parent = "other".into());
    cluster.edit_hierarchy("foo", |spec| spec.required_children = vec!["baz".into()]);
    controller.quiesce().await;

    for ns in ["foo", "other", "baz"] {
        assert!(
            has_condition(&cluster, ns, Code::CritRequiredChildConflict),
            "{} must carry the conflict",
            ns
        );
    }

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn required_children_are_created() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    let controller = Controller::start(Settings::default(), cluster.clone()).await?;
    controller.quiesce().await;

    cluster.edit_hierarchy("foo", |spec| spec.required_children = vec!["kid".into()]);
    controller.quiesce().await;

    let record = cluster.peek_record("kid").expect("kid record must exist");
    assert_eq!(record.spec.parent, "foo");
    let labels = cluster.namespace_labels("kid");
    assert_eq!(labels.get(&depth_label("foo")).map(String::as_str), Some("1"));
    assert_eq!(
        cluster.peek_record("foo").unwrap().status.children,
        vec!["kid"]
    );

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn reconciliation_is_idempotent() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = converge(&cluster, &[("bar", "foo"), ("baz", "bar")]).await?;
    cluster.apply_object(secret("foo", "foo-sec", "foo"));
    controller.quiesce().await;

    let writes = cluster.write_count();
    let deletes = cluster.delete_count();

    // The same spec again, plus a full re-reconciliation of every namespace.
    cluster.edit_hierarchy("bar", |spec| spec.parent = "foo".into());
    for ns in ["foo", "bar", "baz"] {
        controller.enqueue(ns);
    }
    controller.quiesce().await;

    assert_eq!(cluster.write_count(), writes, "second pass must write nothing");
    assert_eq!(cluster.delete_count(), deletes);

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn transient_failures_are_retried() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    cluster.apply_namespace("bar");
    let controller = converge(&cluster, &[("bar", "foo")]).await?;

    cluster.fail_next_writes(2);
    cluster.apply_object(secret("foo", "foo-sec", "foo"));
    controller.quiesce().await;

    let copy = cluster.peek_object(&secrets(), "bar", "foo-sec");
    assert!(copy.is_some(), "the copy must land despite injected faults");
    assert!(controller.metrics().requeues >= 1);

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn blocked_sources_mark_and_recover() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    cluster.apply_namespace("bar");
    let controller = converge(&cluster, &[("bar", "foo")]).await?;

    let mut pinned = secret("foo", "pinned", "foo");
    pinned.finalizers.push("example.com/hold".into());
    cluster.apply_object(pinned);
    controller.quiesce().await;

    assert!(has_condition(&cluster, "foo", Code::CannotPropagate));
    assert!(cluster.peek_object(&secrets(), "bar", "pinned").is_none());

    cluster.apply_object(secret("foo", "pinned", "foo"));
    controller.quiesce().await;
    assert!(!has_condition(&cluster, "foo", Code::CannotPropagate));
    assert!(cluster.peek_object(&secrets(), "bar", "pinned").is_some());

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn namespace_deletion_orphans_children() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let controller = converge(&cluster, &[("bar", "foo"), ("baz", "bar")]).await?;

    cluster.delete_namespace("bar");
    controller.quiesce().await;

    assert!(has_condition(&cluster, "baz", Code::CritParentMissing));
    assert_eq!(
        cluster.peek_record("foo").unwrap().status.children,
        Vec::<String>::new()
    );

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn override_protection_pauses_the_subtree() -> Result<()> {
    let cluster = MemCluster::new();
    for ns in ["foo", "bar", "baz"] {
        cluster.apply_namespace(ns);
    }
    let mut settings = Settings::default();
    settings.propagation.protect_overrides = true;
    let controller = Controller::start(settings, cluster.clone()).await?;
    for (child, parent) in [("bar", "foo"), ("baz", "bar")] {
        cluster.edit_hierarchy(child, |spec| spec.parent = parent.into());
    }
    controller.quiesce().await;
    cluster.apply_object(secret("foo", "foo-sec", "foo"));
    controller.quiesce().await;

    // A user edits the copy in bar.
    let mut edited = cluster.peek_object(&secrets(), "bar", "foo-sec").unwrap();
    edited.data = json!({ "type": "Opaque", "owner": "bar-admin" });
    cluster.apply_object(edited);
    controller.quiesce().await;

    assert!(has_condition(&cluster, "bar", Code::ObjectOverridden));
    assert!(has_condition(&cluster, "foo", Code::ObjectDescendantOverridden));
    let copy = cluster.peek_object(&secrets(), "bar", "foo-sec").unwrap();
    assert_eq!(copy.data["owner"], "bar-admin", "the edit must survive");
    assert_eq!(
        copy.annotations.get(MODIFIED_ANNOTATION).map(String::as_str),
        Some("true")
    );

    // A source edit stops at the overridden copy.
    cluster.apply_object(secret("foo", "foo-sec", "foo-v2"));
    controller.quiesce().await;
    let below = cluster.peek_object(&secrets(), "baz", "foo-sec").unwrap();
    assert_eq!(below.data["owner"], "foo", "the subtree must stay paused");

    // Reverting the copy resumes propagation.
    let source = cluster.peek_object(&secrets(), "foo", "foo-sec").unwrap();
    cluster.apply_object(source.propagate_to("bar"));
    controller.quiesce().await;

    assert!(!has_condition(&cluster, "bar", Code::ObjectOverridden));
    assert!(!has_condition(&cluster, "foo", Code::ObjectDescendantOverridden));
    let copy = cluster.peek_object(&secrets(), "bar", "foo-sec").unwrap();
    assert!(copy.annotations.get(MODIFIED_ANNOTATION).is_none());
    let below = cluster.peek_object(&secrets(), "baz", "foo-sec").unwrap();
    assert_eq!(below.data["owner"], "foo-v2");

    controller.shutdown().await;
    Ok(())
}

#[async_std::test]
async fn excluded_namespaces_are_untouched() -> Result<()> {
    let cluster = MemCluster::new();
    cluster.apply_namespace("foo");
    cluster.apply_namespace("kube-system");
    let mut settings = Settings::default();
    settings.propagation.excluded_namespaces = vec!["kube-system".into()];
    let controller = Controller::start(settings, cluster.clone()).await?;
    controller.quiesce().await;

    cluster.edit_hierarchy("kube-system", |spec| spec.parent = "foo".into());
    cluster.apply_object(secret("kube-system", "token", "sys"));
    controller.quiesce().await;

    assert!(cluster.namespace_labels("kube-system").is_empty());
    let record = cluster.peek_record("kube-system").unwrap();
    assert!(record.status.children.is_empty() && record.status.conditions.is_empty());
    assert_eq!(controller.metrics().drift, 0);

    controller.shutdown().await;
    Ok(())
}
