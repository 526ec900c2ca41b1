//! Runtime assembly of the hns controller: watch routing, worker pools,
//! the affected-namespace forwarder, drift patrols and metric reports, all
//! over the engine in [`hns_forest`].
#![deny(missing_docs)]
mod settings;

pub use crate::settings::{GeneralSettings, PropagationSettings, ResourceSettings, Settings};
pub use hns_forest::{
    depth_label, ApiError, Cluster, Code, Condition, Drift, Gvk, HierarchyRecord, HierarchySpec,
    MemCluster, NamespaceMeta, Object, Snapshot, SyncMode, WatchEvent, INHERITED_FROM,
    MODIFIED_ANNOTATION,
};

use anyhow::Result;
use async_std::task;
use fnv::FnvHashSet;
use futures::future::{self, AbortHandle};
use futures::StreamExt;
use hns_forest::{
    patrol, Affected, HierarchyReconciler, Metrics, NsLocks, ObjectReconciler, SharedForest,
    WorkQueue,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs the tracing stack: env-filtered fmt output to stderr, the log
/// bridge and a panic hook. Safe to call more than once.
pub fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// The running controller: a hierarchy worker pool, one worker pool per
/// tracked kind, the watch router and the affected forwarder, plus the
/// patrol and report loops.
pub struct Controller {
    forest: SharedForest,
    hier_queue: WorkQueue<String>,
    objects: Vec<Arc<ObjectReconciler>>,
    metrics: Arc<Metrics>,
    delayed: Arc<AtomicUsize>,
    workers: Vec<task::JoinHandle<()>>,
    aborts: Vec<AbortHandle>,
}

impl Controller {
    /// Builds the engine, spawns every loop and primes the queues with a
    /// full namespace relist.
    pub async fn start(settings: Settings, cluster: Arc<dyn Cluster>) -> Result<Self> {
        let forest = hns_forest::shared();
        let metrics = Arc::new(Metrics::default());
        let delayed = Arc::new(AtomicUsize::new(0));
        let (affected, mut affected_rx) = Affected::channel();
        let hier_queue: WorkQueue<String> = WorkQueue::new();
        let excluded: Arc<FnvHashSet<String>> = Arc::new(
            settings
                .propagation
                .excluded_namespaces
                .iter()
                .cloned()
                .collect(),
        );

        let mut objects = Vec::new();
        for (gvk, mode) in settings.tracked() {
            if mode == SyncMode::Ignore {
                continue;
            }
            objects.push(Arc::new(ObjectReconciler::new(
                gvk,
                mode,
                forest.clone(),
                cluster.clone(),
                affected.clone(),
                metrics.clone(),
                excluded.clone(),
                settings.propagation.protect_overrides,
            )));
        }
        let hierarchy = Arc::new(HierarchyReconciler::new(
            forest.clone(),
            cluster.clone(),
            Arc::new(NsLocks::new()),
            affected,
            objects.clone(),
            metrics.clone(),
            excluded.clone(),
        ));

        let mut workers = Vec::new();
        let mut aborts = Vec::new();

        // Watch router: external events land in the right queue.
        let mut watch = cluster.watch();
        {
            let hier_queue = hier_queue.clone();
            let objects = objects.clone();
            let (routed, handle) = future::abortable(async move {
                while let Some(event) = watch.next().await {
                    match event {
                        WatchEvent::Namespace(ns) | WatchEvent::Hierarchy(ns) => {
                            hier_queue.enqueue(ns);
                        }
                        WatchEvent::Object(gvk, ns, name) => {
                            if let Some(reconciler) =
                                objects.iter().find(|r| *r.gvk() == gvk)
                            {
                                reconciler.enqueue(&ns, &name);
                            }
                        }
                    }
                }
            });
            aborts.push(handle);
            workers.push(task::spawn(async move {
                routed.await.ok();
            }));
        }

        // Affected forwarder: decouples forest mutation from hierarchy queue
        // backpressure.
        {
            let hier_queue = hier_queue.clone();
            let (forwarded, handle) = future::abortable(async move {
                while let Some(event) = affected_rx.next().await {
                    tracing::debug!(ns = %event.namespace, reason = event.reason, "reconciliation due");
                    hier_queue.enqueue(event.namespace);
                }
            });
            aborts.push(handle);
            workers.push(task::spawn(async move {
                forwarded.await.ok();
            }));
        }

        for _ in 0..settings.general.hierarchy_workers.max(1) {
            let queue = hier_queue.clone();
            let reconciler = hierarchy.clone();
            let metrics = metrics.clone();
            let delayed = delayed.clone();
            workers.push(task::spawn(async move {
                while let Some(ns) = queue.next().await {
                    match reconciler.reconcile(&ns).await {
                        Ok(()) => queue.forget(&ns),
                        Err(err) if err.is_transient() => {
                            metrics.requeue();
                            let delay = queue.backoff(&ns);
                            tracing::warn!(%ns, %err, ?delay, "requeueing hierarchy work");
                            let queue = queue.clone();
                            delayed.fetch_add(1, Ordering::SeqCst);
                            let delayed = delayed.clone();
                            task::spawn(async move {
                                task::sleep(delay).await;
                                queue.enqueue(ns);
                                delayed.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(err) => tracing::error!(%ns, %err, "hierarchy reconciliation failed"),
                    }
                }
            }));
        }

        for reconciler in &objects {
            for _ in 0..settings.general.object_workers.max(1) {
                let queue = reconciler.queue().clone();
                let reconciler = reconciler.clone();
                let metrics = metrics.clone();
                let delayed = delayed.clone();
                workers.push(task::spawn(async move {
                    while let Some(item) = queue.next().await {
                        match reconciler.reconcile(&item.namespace, &item.name).await {
                            Ok(()) => queue.forget(&item),
                            Err(err) if err.is_transient() => {
                                metrics.requeue();
                                let delay = queue.backoff(&item);
                                tracing::warn!(
                                    ns = %item.namespace,
                                    name = %item.name,
                                    %err,
                                    ?delay,
                                    "requeueing object work"
                                );
                                let queue = queue.clone();
                                delayed.fetch_add(1, Ordering::SeqCst);
                                let delayed = delayed.clone();
                                task::spawn(async move {
                                    task::sleep(delay).await;
                                    queue.enqueue(item);
                                    delayed.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(err) => tracing::error!(
                                ns = %item.namespace,
                                name = %item.name,
                                %err,
                                "object reconciliation failed"
                            ),
                        }
                    }
                }));
            }
        }

        // Drift patrol.
        {
            let forest = forest.clone();
            let cluster = cluster.clone();
            let metrics = metrics.clone();
            let excluded = excluded.clone();
            let kinds: Vec<Gvk> = objects.iter().map(|r| r.gvk().clone()).collect();
            let interval = Duration::from_secs(settings.general.patrol_interval_secs.max(1));
            let (patrolled, handle) = future::abortable(async move {
                loop {
                    task::sleep(interval).await;
                    match patrol::scan(&forest, cluster.as_ref(), &kinds, &excluded).await {
                        Ok(drift) if drift.total() > 0 => {
                            metrics.add_drift(drift.total());
                            tracing::warn!(?drift, "patrol found drift");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(%err, "patrol failed"),
                    }
                }
            });
            aborts.push(handle);
            workers.push(task::spawn(async move {
                patrolled.await.ok();
            }));
        }

        // Metric report.
        {
            let forest = forest.clone();
            let metrics = metrics.clone();
            let interval = Duration::from_secs(settings.general.report_interval_secs.max(1));
            let (reported, handle) = future::abortable(async move {
                loop {
                    task::sleep(interval).await;
                    metrics.record_conditions(forest.lock().condition_census());
                    let peak = metrics.sample_peak();
                    tracing::info!(snapshot = ?metrics.snapshot(), peak, "controller heartbeat");
                }
            });
            aborts.push(handle);
            workers.push(task::spawn(async move {
                reported.await.ok();
            }));
        }

        for meta in cluster.list_namespaces().await? {
            hier_queue.enqueue(meta.name);
        }

        Ok(Self {
            forest,
            hier_queue,
            objects,
            metrics,
            delayed,
            workers,
            aborts,
        })
    }

    /// Flags a namespace for reconciliation.
    pub fn enqueue(&self, namespace: &str) {
        self.hier_queue.enqueue(namespace.to_string());
    }

    /// A handle to the forest, for validators and diagnostics.
    pub fn forest(&self) -> SharedForest {
        self.forest.clone()
    }

    /// Current counters.
    pub fn metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Waits until the queues are drained, nothing is in flight and the
    /// counters stop moving. Used by tests and maintenance tooling.
    pub async fn quiesce(&self) {
        let mut stable = 0;
        let mut last = self.metrics.snapshot();
        loop {
            task::sleep(Duration::from_millis(25)).await;
            let idle = self.hier_queue.is_idle()
                && self.objects.iter().all(|r| r.queue().is_idle())
                && self.delayed.load(Ordering::SeqCst) == 0;
            let now = self.metrics.snapshot();
            if idle && now.in_flight == 0 && now == last {
                stable += 1;
                if stable >= 3 {
                    return;
                }
            } else {
                stable = 0;
                last = now;
            }
        }
    }

    /// Stops every loop, drains the workers and returns once they exit.
    pub async fn shutdown(self) {
        for handle in &self.aborts {
            handle.abort();
        }
        self.hier_queue.close();
        for reconciler in &self.objects {
            reconciler.queue().close();
        }
        for worker in self.workers {
            worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn parent_assignment_converges() -> Result<()> {
        let cluster = MemCluster::new();
        cluster.apply_namespace("foo");
        cluster.apply_namespace("bar");
        let controller = Controller::start(Settings::default(), cluster.clone()).await?;
        controller.quiesce().await;

        cluster.edit_hierarchy("bar", |spec| spec.parent = "foo".into());
        controller.quiesce().await;

        let record = cluster.peek_record("foo").unwrap();
        assert_eq!(record.status.children, vec!["bar"]);
        let labels = cluster.namespace_labels("bar");
        assert_eq!(labels.get(&depth_label("bar")).map(String::as_str), Some("0"));
        assert_eq!(labels.get(&depth_label("foo")).map(String::as_str), Some("1"));

        controller.shutdown().await;
        Ok(())
    }
}
