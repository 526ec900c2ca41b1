use crate::api::{ApiError, Cluster, WatchEvent};
use crate::object::{Gvk, Object};
use crate::record::{HierarchyRecord, HierarchySpec, NamespaceMeta};
use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory cluster used by tests and local runs. Every mutation is fanned
/// out to watch subscribers the way an informer cache would deliver it, and
/// a fault counter can make the next writes fail transiently to exercise the
/// requeue paths.
#[derive(Default)]
pub struct MemCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, NamespaceMeta>,
    records: BTreeMap<String, HierarchyRecord>,
    objects: BTreeMap<(Gvk, String, String), Object>,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    next_uid: u64,
    fail_writes: u32,
    writes: u64,
    deletes: u64,
}

impl State {
    fn emit(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn take_fault(&mut self) -> Result<(), ApiError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(ApiError::Transient("injected write failure".into()));
        }
        Ok(())
    }
}

impl MemCluster {
    /// Creates an empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` write operations fail transiently.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    /// Total successful write operations so far, user and controller alike.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Total successful object deletions so far.
    pub fn delete_count(&self) -> u64 {
        self.state.lock().deletes
    }

    /// Creates or refreshes a namespace, as a user would.
    pub fn apply_namespace(&self, name: &str) {
        let mut state = self.state.lock();
        state
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| NamespaceMeta::new(name));
        state.emit(WatchEvent::Namespace(name.to_string()));
    }

    /// Flags a namespace as being torn down.
    pub fn mark_namespace_deleting(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(meta) = state.namespaces.get_mut(name) {
            meta.deleting = true;
        }
        state.emit(WatchEvent::Namespace(name.to_string()));
    }

    /// Deletes a namespace with everything in it.
    pub fn delete_namespace(&self, name: &str) {
        let mut state = self.state.lock();
        state.namespaces.remove(name);
        state.records.remove(name);
        let gone: Vec<(Gvk, String, String)> = state
            .objects
            .keys()
            .filter(|(_, ns, _)| ns == name)
            .cloned()
            .collect();
        for key in gone {
            state.objects.remove(&key);
            state.emit(WatchEvent::Object(key.0, key.1, key.2));
        }
        state.emit(WatchEvent::Hierarchy(name.to_string()));
        state.emit(WatchEvent::Namespace(name.to_string()));
    }

    /// Edits (creating if needed) the hierarchy spec of a namespace, as a
    /// user would through the record resource.
    pub fn edit_hierarchy(&self, namespace: &str, edit: impl FnOnce(&mut HierarchySpec)) {
        let mut state = self.state.lock();
        let record = state
            .records
            .entry(namespace.to_string())
            .or_insert_with(|| HierarchyRecord::new(namespace));
        edit(&mut record.spec);
        state.emit(WatchEvent::Hierarchy(namespace.to_string()));
    }

    /// Flags the hierarchy record of a namespace as being torn down.
    pub fn mark_hierarchy_deleting(&self, namespace: &str) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(namespace) {
            record.deleting = true;
        }
        state.emit(WatchEvent::Hierarchy(namespace.to_string()));
    }

    /// Creates or replaces an object, as a user would.
    pub fn apply_object(&self, mut object: Object) {
        let mut state = self.state.lock();
        let key = (
            object.gvk.clone(),
            object.namespace.clone(),
            object.name.clone(),
        );
        match state.objects.get(&key) {
            Some(existing) => object.uid = existing.uid,
            None => {
                state.next_uid += 1;
                object.uid = state.next_uid;
            }
        }
        state.objects.insert(key.clone(), object);
        state.emit(WatchEvent::Object(key.0, key.1, key.2));
    }

    /// Deletes an object, as a user would.
    pub fn remove_object(&self, gvk: &Gvk, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let key = (gvk.clone(), namespace.to_string(), name.to_string());
        state.objects.remove(&key);
        state.emit(WatchEvent::Object(key.0, key.1, key.2));
    }

    /// Names of the objects of a kind in a namespace, sorted.
    pub fn object_names(&self, gvk: &Gvk, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(g, ns, _)| g == gvk && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Reads an object without going through the adapter.
    pub fn peek_object(&self, gvk: &Gvk, namespace: &str, name: &str) -> Option<Object> {
        self.state
            .lock()
            .objects
            .get(&(gvk.clone(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Reads a hierarchy record without going through the adapter.
    pub fn peek_record(&self, namespace: &str) -> Option<HierarchyRecord> {
        self.state.lock().records.get(namespace).cloned()
    }

    /// Reads namespace labels without going through the adapter.
    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .namespaces
            .get(name)
            .map(|meta| meta.labels.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Cluster for MemCluster {
    async fn namespace(&self, name: &str) -> Result<Option<NamespaceMeta>, ApiError> {
        Ok(self.state.lock().namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceMeta>, ApiError> {
        Ok(self.state.lock().namespaces.values().cloned().collect())
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        if state.namespaces.contains_key(name) {
            return Ok(());
        }
        state
            .namespaces
            .insert(name.to_string(), NamespaceMeta::new(name));
        state.writes += 1;
        state.emit(WatchEvent::Namespace(name.to_string()));
        Ok(())
    }

    async fn update_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        match state.namespaces.get_mut(name) {
            Some(meta) => meta.labels = labels,
            None => return Err(ApiError::NotFound),
        }
        state.writes += 1;
        state.emit(WatchEvent::Namespace(name.to_string()));
        Ok(())
    }

    async fn hierarchy(&self, namespace: &str) -> Result<Option<HierarchyRecord>, ApiError> {
        Ok(self.state.lock().records.get(namespace).cloned())
    }

    async fn put_hierarchy(&self, record: HierarchyRecord) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        let namespace = record.namespace.clone();
        state.records.insert(namespace.clone(), record);
        state.writes += 1;
        state.emit(WatchEvent::Hierarchy(namespace));
        Ok(())
    }

    async fn object(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Object>, ApiError> {
        Ok(self
            .state
            .lock()
            .objects
            .get(&(gvk.clone(), namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_objects(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Object>, ApiError> {
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((g, ns, _), _)| g == gvk && ns == namespace)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create_object(&self, mut object: Object) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        let key = (
            object.gvk.clone(),
            object.namespace.clone(),
            object.name.clone(),
        );
        if let Some(existing) = state.objects.get(&key) {
            return Err(ApiError::AlreadyExists { uid: existing.uid });
        }
        state.next_uid += 1;
        object.uid = state.next_uid;
        state.objects.insert(key.clone(), object);
        state.writes += 1;
        state.emit(WatchEvent::Object(key.0, key.1, key.2));
        Ok(())
    }

    async fn update_object(&self, mut object: Object) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        let key = (
            object.gvk.clone(),
            object.namespace.clone(),
            object.name.clone(),
        );
        match state.objects.get(&key) {
            Some(existing) => object.uid = existing.uid,
            None => return Err(ApiError::NotFound),
        }
        state.objects.insert(key.clone(), object);
        state.writes += 1;
        state.emit(WatchEvent::Object(key.0, key.1, key.2));
        Ok(())
    }

    async fn delete_object(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        let key = (gvk.clone(), namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(ApiError::NotFound);
        }
        state.deletes += 1;
        state.emit(WatchEvent::Object(key.0, key.1, key.2));
        Ok(())
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().watchers.push(tx);
        rx
    }
}
