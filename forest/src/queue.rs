use fnv::{FnvHashMap, FnvHashSet, FnvHasher};
use futures::channel::mpsc;
use futures::StreamExt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHARDS: usize = 16;

/// A work queue with one slot per item: enqueueing an item already pending
/// is a no-op, so a burst of watch events collapses into a single
/// reconciliation. Workers share the receiver behind an async mutex and pull
/// one item at a time; processing happens outside the queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: futures::lock::Mutex<mpsc::UnboundedReceiver<T>>,
    pending: parking_lot::Mutex<FnvHashSet<T>>,
    attempts: parking_lot::Mutex<FnvHashMap<T, u32>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: futures::lock::Mutex::new(rx),
                pending: Default::default(),
                attempts: Default::default(),
            }),
        }
    }

    /// Adds an item unless it is already pending. Returns true if it was
    /// added.
    pub fn enqueue(&self, item: T) -> bool {
        {
            let mut pending = self.inner.pending.lock();
            if !pending.insert(item.clone()) {
                return false;
            }
        }
        self.inner.tx.unbounded_send(item).is_ok()
    }

    /// Hands out the next item, or `None` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> Option<T> {
        let mut rx = self.inner.rx.lock().await;
        let item = rx.next().await?;
        self.inner.pending.lock().remove(&item);
        Some(item)
    }

    /// Clears the failure history of an item after it succeeds.
    pub fn forget(&self, item: &T) {
        self.inner.attempts.lock().remove(item);
    }

    /// Records a failure of the item and returns how long to wait before
    /// re-enqueueing it, doubling per consecutive failure.
    pub fn backoff(&self, item: &T) -> Duration {
        let mut attempts = self.inner.attempts.lock();
        let count = attempts.entry(item.clone()).or_insert(0);
        *count += 1;
        let exponent = (*count - 1).min(7);
        Duration::from_millis(50u64 << exponent)
    }

    /// Closes the queue; workers exit after draining.
    pub fn close(&self) {
        self.inner.tx.close_channel();
    }

    /// True when no item is pending.
    pub fn is_idle(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sharded map of per-namespace locks serializing reconciliations of the
/// same namespace, handing out a monotonic correlation id for logs.
pub struct NsLocks {
    shards: Vec<parking_lot::Mutex<FnvHashMap<String, Arc<futures::lock::Mutex<()>>>>>,
    seq: AtomicU64,
}

impl NsLocks {
    /// Creates the lock map.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Default::default()).collect(),
            seq: AtomicU64::new(0),
        }
    }

    /// Returns the lock for a namespace together with a fresh correlation
    /// id. The caller awaits the lock; holding it serializes the namespace.
    pub fn handle(&self, namespace: &str) -> (Arc<futures::lock::Mutex<()>>, u64) {
        let mut hasher = FnvHasher::default();
        namespace.hash(&mut hasher);
        let shard = &self.shards[hasher.finish() as usize % SHARDS];
        let lock = shard
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .clone();
        (lock, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Default for NsLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// A namespace whose reconciliation became due because of a change
/// elsewhere in the forest.
#[derive(Clone, Debug)]
pub struct AffectedEvent {
    /// Namespace to reconcile.
    pub namespace: String,
    /// Why it became due; used for logs only.
    pub reason: &'static str,
}

/// Producer side of the affected-namespace bus. Sends never block, so
/// reconcilers may enqueue relatives while holding the forest lock; a
/// dedicated forwarder drains the bus into the hierarchy work queue.
#[derive(Clone)]
pub struct Affected {
    tx: mpsc::UnboundedSender<AffectedEvent>,
}

impl Affected {
    /// Creates the bus, returning the producer and the consumer end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AffectedEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    /// Flags a namespace for reconciliation.
    pub fn enqueue(&self, namespace: &str, reason: &'static str) {
        self.tx
            .unbounded_send(AffectedEvent {
                namespace: namespace.to_string(),
                reason,
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn duplicate_enqueues_collapse() {
        let queue = WorkQueue::new();
        assert!(queue.enqueue("foo".to_string()));
        assert!(!queue.enqueue("foo".to_string()));
        assert!(queue.enqueue("bar".to_string()));
        assert!(!queue.is_idle());

        assert_eq!(queue.next().await.as_deref(), Some("foo"));
        // The slot is free again once the item is handed out.
        assert!(queue.enqueue("foo".to_string()));
        assert_eq!(queue.next().await.as_deref(), Some("bar"));
        assert_eq!(queue.next().await.as_deref(), Some("foo"));
        assert!(queue.is_idle());
    }

    #[async_std::test]
    async fn closing_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.enqueue(1u32);
        queue.close();
        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn backoff_doubles_until_forgotten() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let item = "foo".to_string();
        assert_eq!(queue.backoff(&item), Duration::from_millis(50));
        assert_eq!(queue.backoff(&item), Duration::from_millis(100));
        assert_eq!(queue.backoff(&item), Duration::from_millis(200));
        queue.forget(&item);
        assert_eq!(queue.backoff(&item), Duration::from_millis(50));
    }

    #[test]
    fn correlation_ids_increase() {
        let locks = NsLocks::new();
        let (_, a) = locks.handle("foo");
        let (_, b) = locks.handle("foo");
        let (_, c) = locks.handle("bar");
        assert!(a < b && b < c);
    }

    #[async_std::test]
    async fn same_namespace_hands_out_the_same_lock() {
        let locks = NsLocks::new();
        let (first, _) = locks.handle("foo");
        let (second, _) = locks.handle("foo");
        let guard = first.lock().await;
        assert!(second.try_lock().is_none());
        drop(guard);
        assert!(second.try_lock().is_some());
    }

    #[async_std::test]
    async fn affected_events_carry_reasons() {
        let (affected, mut rx) = Affected::channel();
        affected.enqueue("foo", "parent changed");
        let event = rx.next().await.unwrap();
        assert_eq!(event.namespace, "foo");
        assert_eq!(event.reason, "parent changed");
    }
}
