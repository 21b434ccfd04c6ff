use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use futures::FutureExt;
use kube::Resource;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::SharedCache,
    error_sink::ErrorSink,
    errors::ControllerError,
    object_key::ObjectKey,
    reconciler::{ReconcileState, Reconciler},
    utils::{metric_name, panic_message},
    work_queue::RateLimitingQueue,
};

const NFS_VOLUME_CONTROLLER: &str = "nfs_volume_controller";
const WORKER: &str = "worker";
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of retries after the first failed attempt before a key is dropped.
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 15;

/// Named "has completed its initial list" predicate of a cache.
pub(crate) struct CacheSynced {
    kind: &'static str,
    synced: Box<dyn Fn() -> bool + Send + Sync>,
}

impl CacheSynced {
    pub fn of<K>(kind: &'static str, cache: &SharedCache<K>) -> Self
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        let cache = cache.clone();
        Self {
            kind,
            synced: Box::new(move || cache.has_synced()),
        }
    }
}

/// Block until every cache has synced. Fails if `stop` fires first.
pub(crate) async fn wait_for_cache_sync(
    stop: &CancellationToken,
    caches: &[CacheSynced],
) -> Result<(), ControllerError> {
    let mut poll = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);
    loop {
        let pending: Vec<&str> = caches
            .iter()
            .filter(|c| !(c.synced)())
            .map(|c| c.kind)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(ControllerError::CacheSync(pending.join(", "))),
            _ = poll.tick() => {}
        }
    }
}

struct ControllerMetrics {
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    retries_exhausted: Counter<u64>,
}

impl ControllerMetrics {
    fn new() -> Self {
        let meter: Meter = global::meter(NFS_VOLUME_CONTROLLER);
        Self {
            reconcile_count: meter
                .u64_counter(metric_name("reconcile_count"))
                .with_description("Count of NFSVolume reconcile invocations")
                .build(),
            reconcile_errors: meter
                .u64_counter(metric_name("reconcile_errors"))
                .with_description("Count of failed NFSVolume reconcile invocations")
                .build(),
            reconcile_duration: meter
                .u64_histogram(metric_name("reconcile_duration_ms"))
                .with_description("Reconcile duration of NFSVolume objects in milliseconds")
                .with_unit("ms")
                .build(),
            retries_exhausted: meter
                .u64_counter(metric_name("retries_exhausted"))
                .with_description("Count of keys dropped after exhausting their retries")
                .build(),
        }
    }
}

/// Drives [`Reconciler`] from a shared work queue with a pool of workers.
pub(crate) struct NfsVolumeController {
    queue: RateLimitingQueue<ObjectKey>,
    reconciler: Arc<Reconciler>,
    caches: Vec<CacheSynced>,
    errors: ErrorSink,
    max_retries: u32,
    /// Consecutive failed attempts per key. The rate limiter history also
    /// includes rate limited adds of the event translator.
    failures: Mutex<HashMap<ObjectKey, u32>>,
    metrics: ControllerMetrics,
}

impl NfsVolumeController {
    pub fn new(
        queue: RateLimitingQueue<ObjectKey>,
        reconciler: Reconciler,
        caches: Vec<CacheSynced>,
        errors: ErrorSink,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            reconciler: Arc::new(reconciler),
            caches,
            errors,
            max_retries,
            failures: Default::default(),
            metrics: ControllerMetrics::new(),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<ObjectKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failed attempt of `key`, returns the number of consecutive failures.
    fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut failures = self.failures();
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, key: &ObjectKey) {
        self.failures().remove(key);
        self.queue.forget(key);
    }

    /// Wait for the caches, then process keys with `workers` workers until
    /// `stop` fires. Keys already queued at that point are drained before
    /// returning.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        stop: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!("waiting for {} caches to sync", self.caches.len());
        if let Err(e) = wait_for_cache_sync(&stop, &self.caches).await {
            self.queue.shut_down();
            return Err(e);
        }
        let workers = workers.max(1);
        info!("caches synced, starting {} workers", workers);
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let this = self.clone();
                tokio::spawn(async move { this.run_worker(id).await })
            })
            .collect();

        stop.cancelled().await;
        info!("shutting down workers, {} keys left to drain", self.queue.len());
        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker terminated abnormally: {}", e);
            }
        }
        info!("all workers stopped");
        Ok(())
    }

    async fn run_worker(&self, id: usize) {
        debug!("worker {} started", id);
        while self.process_next_item().await {}
        debug!("worker {} stopped", id);
    }

    /// Process one key, `false` once the queue is shut down and drained.
    async fn process_next_item(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        let started = Instant::now();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ControllerError::Panicked {
                    key: key.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            });
        let elapsed = started.elapsed().as_millis() as u64;
        self.handle_result(&key, result, elapsed);
        self.queue.done(&key);
        true
    }

    fn handle_result(
        &self,
        key: &ObjectKey,
        result: Result<ReconcileState, ControllerError>,
        elapsed_ms: u64,
    ) {
        match result {
            Ok(state) => {
                let labels = [KeyValue::new("state", state.as_str())];
                self.metrics.reconcile_count.add(1, &labels);
                self.metrics.reconcile_duration.record(elapsed_ms, &labels);
                self.forget(key);
                info!("successfully synced '{}' ({})", key, state);
            }
            Err(e) => {
                self.metrics.reconcile_count.add(1, &[]);
                self.metrics.reconcile_errors.add(1, &[]);
                let failures = self.record_failure(key);
                if e.is_temporary() && failures <= self.max_retries {
                    self.errors.report(
                        WORKER,
                        format!("error syncing '{}' (attempt {}): {}", key, failures, e),
                    );
                    if self.queue.is_shutting_down() {
                        debug!("not retrying '{}', the queue is shutting down", key);
                    } else {
                        self.queue.add_rate_limited(key.clone());
                        debug!(
                            "requeued '{}' with backoff, {} rate limited adds",
                            key,
                            self.queue.num_requeues(key)
                        );
                    }
                } else {
                    self.forget(key);
                    self.metrics.retries_exhausted.add(1, &[]);
                    self.errors.report(
                        WORKER,
                        format!(
                            "dropping '{}' out of the queue after {} retries: {}",
                            key,
                            failures - 1,
                            e
                        ),
                    );
                }
            }
        }
    }
}
