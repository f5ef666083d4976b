//! Worker pool: pulls binding keys off the queue and runs one reconcile-and-commit
//! cycle per key.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use pcl_commit::Committer;
use pcl_core::{AggregateError, ApiBinding, ApiExport, GroupResource, Keyed, ObjectKey, ReconcileError, TenantId};
use pcl_queue::{default_controller_rate_limiter, RateLimitConfig, WorkQueue};
use pcl_store::indexers::{
    claimed_group_resource_key, index_binding_by_cluster_and_accepted_claimed_group_resources,
    index_bindings_by_api_export, index_by_logical_cluster_path_and_name,
    BINDINGS_BY_API_EXPORT, BINDING_BY_CLUSTER_AND_ACCEPTED_CLAIMED_GROUP_RESOURCES, BY_LOGICAL_CLUSTER_PATH_AND_NAME,
};
use pcl_store::{Cache, IndexError, Informer, OnAnyChange};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconcile::Reconcile;

pub const CONTROLLER_NAME: &str = "pcl-permissionclaimlabel";

/// Register the indexes the controller's lookups depend on. Must succeed before any
/// handler is attached; an error here is a startup failure.
pub fn install_indexers(bindings: &Cache<ApiBinding>, exports: &[&Cache<ApiExport>]) -> Result<(), IndexError> {
    for cache in exports {
        cache.add_indexers_if_not_present(&[(BY_LOGICAL_CLUSTER_PATH_AND_NAME, index_by_logical_cluster_path_and_name)])?;
    }
    bindings.add_indexers(&[(
        BINDING_BY_CLUSTER_AND_ACCEPTED_CLAIMED_GROUP_RESOURCES,
        index_binding_by_cluster_and_accepted_claimed_group_resources,
    )])?;
    bindings.add_indexers_if_not_present(&[(BINDINGS_BY_API_EXPORT, index_bindings_by_api_export)])
}

fn enqueue(queue: &WorkQueue<String>, key: &ObjectKey) {
    let token = key.encode();
    debug!(key = %token, "queueing APIBinding");
    queue.add(token);
}

fn enqueue_indexed(bindings: &Cache<ApiBinding>, queue: &WorkQueue<String>, index: &str, value: &str) {
    match bindings.index_keys(index, value) {
        Ok(keys) => keys.iter().for_each(|k| enqueue(queue, k)),
        Err(e) => error!(index, value, error = %e, "reverse lookup failed"),
    }
}

fn enqueue_bindings_for_export(bindings: &Cache<ApiBinding>, queue: &WorkQueue<String>, export: &ApiExport) {
    for value in index_by_logical_cluster_path_and_name(export) {
        enqueue_indexed(bindings, queue, BINDINGS_BY_API_EXPORT, &value);
    }
}

pub struct Controller {
    queue: WorkQueue<String>,
    bindings: Arc<Cache<ApiBinding>>,
    reconciler: Arc<dyn Reconcile>,
    committer: Committer,
}

impl Controller {
    pub fn new(
        rate_limit: &RateLimitConfig,
        bindings: Arc<Cache<ApiBinding>>,
        reconciler: Arc<dyn Reconcile>,
        committer: Committer,
    ) -> Self {
        Self {
            queue: WorkQueue::new(CONTROLLER_NAME, default_controller_rate_limiter(rate_limit)),
            bindings,
            reconciler,
            committer,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> { &self.queue }

    /// Every binding add, update and delete enqueues that binding.
    pub fn watch_bindings(&self, informer: &Informer<ApiBinding>) {
        let queue = self.queue.clone();
        informer.add_event_handler(Arc::new(OnAnyChange(move |b: &ApiBinding| enqueue(&queue, &b.object_key()))));
    }

    /// Every export change enqueues the bindings that reference it, by tenant or by path.
    pub fn watch_exports(&self, informer: &Informer<ApiExport>) {
        let queue = self.queue.clone();
        let bindings = Arc::clone(&self.bindings);
        informer.add_event_handler(Arc::new(OnAnyChange(move |e: &ApiExport| {
            enqueue_bindings_for_export(&bindings, &queue, e)
        })));
    }

    pub fn enqueue_binding(&self, key: &ObjectKey) { enqueue(&self.queue, key) }

    pub fn enqueue_bindings_for_export(&self, export: &ApiExport) {
        enqueue_bindings_for_export(&self.bindings, &self.queue, export)
    }

    /// Enqueue the bindings in `tenant` that accepted a claim on `gr`.
    pub fn enqueue_for_claimed_resource(&self, tenant: &TenantId, gr: &GroupResource) {
        let value = claimed_group_resource_key(tenant, gr);
        enqueue_indexed(&self.bindings, &self.queue, BINDING_BY_CLUSTER_AND_ACCEPTED_CLAIMED_GROUP_RESOURCES, &value);
    }

    /// Run `workers` workers until `cancel` fires, then stop handing out keys and wait
    /// for in-flight cycles to finish.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken, workers: usize) {
        info!(controller = CONTROLLER_NAME, workers, "starting controller");
        let mut pool = JoinSet::new();
        for worker in 0..workers.max(1) {
            let ctl = Arc::clone(&self);
            pool.spawn(async move {
                while ctl.process_next_work_item().await {}
                debug!(worker, "worker exited");
            });
        }
        cancel.cancelled().await;
        self.queue.shut_down();
        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!(controller = CONTROLLER_NAME, "controller stopped");
    }

    /// Handle one key. Returns `false` once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(token) = self.queue.get().await else {
            return false;
        };
        debug!(key = %token, "processing key");
        let t0 = Instant::now();
        let result = match AssertUnwindSafe(self.process(&token)).catch_unwind().await {
            Ok(Ok(())) => {
                self.queue.forget(&token);
                "ok"
            }
            Ok(Err(e)) => {
                error!(controller = CONTROLLER_NAME, key = %token, error = %e, "failed to sync");
                self.queue.add_rate_limited(token.clone());
                "error"
            }
            Err(_) => {
                error!(controller = CONTROLLER_NAME, key = %token, "panic while processing key");
                self.queue.add_rate_limited(token.clone());
                "panic"
            }
        };
        self.queue.done(&token);
        counter!("reconcile_total", 1u64, "result" => result);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        true
    }

    async fn process(&self, token: &str) -> Result<(), ReconcileError> {
        let key = match ObjectKey::decode(token) {
            Ok(k) => k,
            Err(e) => {
                counter!("malformed_keys_total", 1u64);
                warn!(key = %token, error = %e, "dropping malformed key");
                return Ok(());
            }
        };
        let Some(cached) = self.bindings.get(&key) else {
            debug!(key = %token, "object deleted before it was handled");
            return Ok(());
        };
        let old: &ApiBinding = &cached;
        let mut new = old.clone();

        let mut errs = Vec::new();
        if let Err(e) = self.reconciler.reconcile(&mut new).await {
            errs.push(e);
        }
        if let Err(e) = self.committer.commit(old, &new).await {
            errs.push(e);
        }
        AggregateError::flatten(errs)
    }
}
