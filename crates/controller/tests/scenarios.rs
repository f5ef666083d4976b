#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pcl_commit::{Channel, Committer, Patcher};
use pcl_controller::{
    install_indexers, ClaimLabel, ClaimLabeler, Controller, PermissionClaimLabelReconciler, Reconcile,
};
use pcl_core::{
    find_condition, AcceptablePermissionClaim, AcceptanceState, ApiBinding, ApiBindingSpec, ApiBindingStatus, ApiExport,
    ApiExportSpec, BindingReference, ConditionStatus, Delta, ExportBindingReference, ObjectKey, ObjectMeta,
    PermissionClaim, ReconcileError, StoreError, TenantId, CONDITION_PERMISSION_CLAIMS_APPLIED, PATH_ANNOTATION,
};
use pcl_queue::RateLimitConfig;
use pcl_store::{CrossScopeResolver, IndexError, Informer};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeLabeler {
    labels: Mutex<BTreeSet<(String, String, String)>>,
    calls: Mutex<Vec<String>>,
    fail: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl ClaimLabeler for FakeLabeler {
    async fn label(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(format!("+{}", claim.resource));
        if self.fail.lock().unwrap().contains(&claim.resource) {
            return Err(StoreError::Transient("labeling refused".into()));
        }
        self.labels.lock().unwrap().insert((tenant.to_string(), claim.resource.clone(), label.key.clone()));
        Ok(())
    }

    async fn unlabel(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(format!("-{}", claim.resource));
        self.labels.lock().unwrap().remove(&(tenant.to_string(), claim.resource.clone(), label.key.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct FakePatcher {
    calls: Mutex<Vec<(String, Channel, Json)>>,
    status_conflicts: Mutex<usize>,
}

impl FakePatcher {
    fn calls(&self) -> Vec<(String, Channel, Json)> { self.calls.lock().unwrap().clone() }
}

#[async_trait]
impl Patcher for FakePatcher {
    async fn patch(&self, key: &ObjectKey, channel: Channel, patch: Json) -> Result<Option<String>, StoreError> {
        self.calls.lock().unwrap().push((key.encode(), channel, patch));
        let mut left = self.status_conflicts.lock().unwrap();
        if channel == Channel::Status && *left > 0 {
            *left -= 1;
            return Err(StoreError::Conflict("resourceVersion moved".into()));
        }
        Ok(None)
    }
}

struct Harness {
    bindings: Arc<Informer<ApiBinding>>,
    exports: Arc<Informer<ApiExport>>,
    global: Arc<Informer<ApiExport>>,
    labeler: Arc<FakeLabeler>,
    patcher: Arc<FakePatcher>,
    ctl: Arc<Controller>,
}

fn fast_backoff() -> RateLimitConfig {
    RateLimitConfig { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(50), qps: 1000.0, burst: 1000 }
}

fn harness_with(reconciler: Option<Arc<dyn Reconcile>>) -> Harness {
    let bindings = Arc::new(Informer::new("apibindings"));
    let exports = Arc::new(Informer::new("apiexports"));
    let global = Arc::new(Informer::new("apiexports-global"));
    install_indexers(bindings.cache(), &[exports.cache().as_ref(), global.cache().as_ref()]).unwrap();

    let labeler = Arc::new(FakeLabeler::default());
    let patcher = Arc::new(FakePatcher::default());
    let reconciler = reconciler.unwrap_or_else(|| {
        let resolver = CrossScopeResolver::new(Arc::clone(exports.cache()), Arc::clone(global.cache()));
        let default: Arc<dyn Reconcile> = Arc::new(PermissionClaimLabelReconciler::new(resolver, labeler.clone()));
        default
    });
    let ctl = Arc::new(Controller::new(
        &fast_backoff(),
        Arc::clone(bindings.cache()),
        reconciler,
        Committer::new(patcher.clone()),
    ));
    ctl.watch_bindings(&bindings);
    ctl.watch_exports(&exports);
    ctl.watch_exports(&global);
    Harness { bindings, exports, global, labeler, patcher, ctl }
}

fn harness() -> Harness { harness_with(None) }

fn tenant(s: &str) -> TenantId { TenantId::new(s).unwrap() }

fn export(tenant_id: &str, name: &str, offers: &[&str]) -> ApiExport {
    let mut meta = ObjectMeta::new(tenant(tenant_id), name);
    meta.uid = Some(format!("uid-{name}"));
    meta.resource_version = Some("1".into());
    ApiExport {
        meta,
        spec: ApiExportSpec { permission_claims: offers.iter().map(|r| PermissionClaim::new("", *r)).collect() },
        status: Default::default(),
    }
}

fn binding(tenant_id: &str, name: &str, export_path: &str, export_name: &str, accepts: &[&str], rv: &str) -> ApiBinding {
    let mut meta = ObjectMeta::new(tenant(tenant_id), name);
    meta.uid = Some(format!("uid-{name}"));
    meta.resource_version = Some(rv.into());
    ApiBinding {
        meta,
        spec: ApiBindingSpec {
            reference: BindingReference {
                export: Some(ExportBindingReference { path: export_path.into(), name: export_name.into() }),
            },
            permission_claims: accepts
                .iter()
                .map(|r| AcceptablePermissionClaim { claim: PermissionClaim::new("", *r), state: AcceptanceState::Accepted })
                .collect(),
        },
        status: Default::default(),
    }
}

async fn step(h: &Harness) -> bool {
    tokio::time::timeout(Duration::from_secs(1), h.ctl.process_next_work_item()).await.expect("no work item arrived")
}

fn requeues(h: &Harness, token: &str) -> u32 { h.ctl.queue().num_requeues(&token.to_string()) }

/// Feed the committed status back through the watch, as the store would.
fn observe_commit(h: &Harness, mut obj: ApiBinding, rv: &str) {
    let calls = h.patcher.calls();
    let (_, _, patch) = calls.iter().rev().find(|(_, c, _)| *c == Channel::Status).expect("no status patch");
    obj.status = serde_json::from_value::<ApiBindingStatus>(patch["status"].clone()).unwrap();
    obj.meta.resource_version = Some(rv.into());
    h.bindings.deliver(Delta::Applied(obj));
}

#[tokio::test]
async fn accepted_and_offered_claim_is_labeled_and_recorded_in_status() {
    let h = harness();
    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps", "secrets"])));
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "e", &["configmaps"], "1")));
    assert_eq!(h.ctl.queue().len(), 1);

    assert!(step(&h).await);

    assert_eq!(*h.labeler.calls.lock().unwrap(), vec!["+configmaps"]);
    let calls = h.patcher.calls();
    assert_eq!(calls.len(), 1);
    let (key, channel, patch) = &calls[0];
    assert_eq!(key, "t1|x");
    assert_eq!(*channel, Channel::Status);
    assert_eq!(patch["status"]["appliedPermissionClaims"], json!([{"group": "", "resource": "configmaps"}]));
    assert_eq!(patch["status"]["exportPermissionClaims"].as_array().unwrap().len(), 2);
    assert_eq!(patch["status"]["conditions"][0]["type"], "PermissionClaimsApplied");
    assert_eq!(patch["status"]["conditions"][0]["status"], "True");
    assert_eq!(patch["metadata"]["resourceVersion"], "1");
    assert_eq!(patch["metadata"]["uid"], "uid-x");
    assert_eq!(requeues(&h, "t1|x"), 0);
}

#[tokio::test]
async fn converged_binding_commits_nothing() {
    let h = harness();
    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps", "secrets"])));
    let b = binding("t1", "x", "", "e", &["configmaps"], "1");
    h.bindings.deliver(Delta::Applied(b.clone()));
    assert!(step(&h).await);

    observe_commit(&h, b, "2");
    assert!(step(&h).await);

    assert_eq!(h.patcher.calls().len(), 1);
    assert_eq!(h.labeler.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn deleted_before_processing_is_forgotten_without_commit() {
    let h = harness();
    let b = binding("t1", "x", "", "e", &["configmaps"], "1");
    h.bindings.deliver(Delta::Applied(b.clone()));
    h.bindings.deliver(Delta::Deleted(b));
    assert_eq!(h.ctl.queue().len(), 1);

    assert!(step(&h).await);

    assert!(h.patcher.calls().is_empty());
    assert!(h.labeler.calls.lock().unwrap().is_empty());
    assert_eq!(requeues(&h, "t1|x"), 0);
    assert!(h.ctl.queue().is_empty());
}

#[tokio::test]
async fn status_conflict_requeues_and_retry_reads_fresh_object() {
    let h = harness();
    *h.patcher.status_conflicts.lock().unwrap() = 1;
    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps", "secrets"])));
    let b = binding("t1", "x", "", "e", &["configmaps"], "1");
    h.bindings.deliver(Delta::Applied(b.clone()));

    assert!(step(&h).await);
    assert_eq!(requeues(&h, "t1|x"), 1);

    // another writer moved the object; the watch delivers the new version
    let mut moved = b;
    moved.meta.resource_version = Some("2".into());
    h.bindings.deliver(Delta::Applied(moved));

    assert!(step(&h).await);
    assert_eq!(requeues(&h, "t1|x"), 0);

    let calls = h.patcher.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, c, _)| *c == Channel::Status));
    assert_eq!(calls[1].2["metadata"]["resourceVersion"], "2");
    assert_eq!(calls[1].2["status"]["appliedPermissionClaims"], json!([{"group": "", "resource": "configmaps"}]));
    assert_eq!(h.labeler.labels.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_export_sets_condition_without_retry() {
    let h = harness();
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "missing", &["configmaps"], "1")));
    assert!(step(&h).await);

    let calls = h.patcher.calls();
    assert_eq!(calls.len(), 1);
    let cond = &calls[0].2["status"]["conditions"][0];
    assert_eq!(cond["status"], "False");
    assert_eq!(cond["reason"], "APIExportNotFound");
    assert!(h.labeler.calls.lock().unwrap().is_empty());
    assert_eq!(requeues(&h, "t1|x"), 0);
}

#[tokio::test]
async fn export_from_global_cache_is_used_when_absent_locally() {
    let h = harness();
    let mut e = export("t9", "e", &["secrets"]);
    e.meta.annotations.insert(PATH_ANNOTATION.into(), "root:org".into());
    h.global.deliver(Delta::Applied(e));
    h.bindings.deliver(Delta::Applied(binding("t2", "x", "root:org", "e", &["secrets"], "1")));

    assert!(step(&h).await);
    let labels = h.labeler.labels.lock().unwrap();
    assert_eq!(labels.len(), 1);
    assert!(labels.iter().all(|(t, r, _)| t == "t2" && r == "secrets"));
}

#[tokio::test]
async fn export_change_requeues_dependents_and_unlabels_withdrawn_claims() {
    let h = harness();
    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps", "secrets"])));
    let b = binding("t1", "x", "", "e", &["configmaps"], "1");
    h.bindings.deliver(Delta::Applied(b.clone()));
    assert!(step(&h).await);
    observe_commit(&h, b, "2");
    assert!(step(&h).await);
    assert!(h.ctl.queue().is_empty());

    let mut narrowed = export("t1", "e", &["secrets"]);
    narrowed.meta.resource_version = Some("2".into());
    h.exports.deliver(Delta::Applied(narrowed));
    assert_eq!(h.ctl.queue().len(), 1);

    assert!(step(&h).await);
    assert_eq!(*h.labeler.calls.lock().unwrap(), vec!["+configmaps", "-configmaps"]);
    assert!(h.labeler.labels.lock().unwrap().is_empty());
    let calls = h.patcher.calls();
    let last = &calls.last().unwrap().2;
    assert_eq!(last["status"]["appliedPermissionClaims"], Json::Null);
    assert_eq!(last["metadata"]["resourceVersion"], "2");
}

#[tokio::test]
async fn labeling_failure_is_reported_and_retried() {
    let h = harness();
    h.labeler.fail.lock().unwrap().insert("configmaps".into());
    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps"])));
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "e", &["configmaps"], "1")));

    assert!(step(&h).await);
    assert_eq!(requeues(&h, "t1|x"), 1);
    let calls = h.patcher.calls();
    let status: ApiBindingStatus = serde_json::from_value(calls[0].2["status"].clone()).unwrap();
    let cond = find_condition(&status.conditions, CONDITION_PERMISSION_CLAIMS_APPLIED).unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason.as_deref(), Some("LabelingFailed"));
    assert!(status.applied_permission_claims.is_empty());
}

#[tokio::test]
async fn claimed_resource_lookup_enqueues_accepting_bindings_only() {
    let h = harness();
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "e", &["configmaps"], "1")));
    let drained = h.ctl.queue().get().await.unwrap();
    h.ctl.queue().done(&drained);
    assert!(h.ctl.queue().is_empty());

    h.ctl.enqueue_for_claimed_resource(&tenant("t1"), &PermissionClaim::new("", "secrets").group_resource());
    assert!(h.ctl.queue().is_empty());
    h.ctl.enqueue_for_claimed_resource(&tenant("t2"), &PermissionClaim::new("", "configmaps").group_resource());
    assert!(h.ctl.queue().is_empty());
    h.ctl.enqueue_for_claimed_resource(&tenant("t1"), &PermissionClaim::new("", "configmaps").group_resource());
    assert_eq!(h.ctl.queue().len(), 1);
}

#[tokio::test]
async fn malformed_key_is_dropped() {
    let h = harness();
    h.ctl.queue().add("no-separator".into());
    assert!(step(&h).await);
    assert!(h.patcher.calls().is_empty());
    assert_eq!(requeues(&h, "no-separator"), 0);
}

struct Panics;

#[async_trait]
impl Reconcile for Panics {
    async fn reconcile(&self, _binding: &mut ApiBinding) -> Result<(), ReconcileError> {
        panic!("predicate bug")
    }
}

#[tokio::test]
async fn panicking_reconcile_is_isolated_and_requeued() {
    let h = harness_with(Some(Arc::new(Panics)));
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "e", &[], "1")));
    assert!(step(&h).await);
    assert_eq!(requeues(&h, "t1|x"), 1);
    assert!(h.patcher.calls().is_empty());
}

#[test]
fn second_index_install_on_bindings_is_fatal() {
    let h = harness();
    let err = install_indexers(h.bindings.cache(), &[h.exports.cache().as_ref()]).unwrap_err();
    assert!(matches!(err, IndexError::Conflict(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_runs_workers_until_cancelled() {
    let h = harness();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&h.ctl).start(cancel.clone(), 2));

    h.exports.deliver(Delta::Applied(export("t1", "e", &["configmaps"])));
    h.bindings.deliver(Delta::Applied(binding("t1", "x", "", "e", &["configmaps"], "1")));
    h.bindings.deliver(Delta::Applied(binding("t1", "y", "", "e", &["configmaps"], "1")));

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.patcher.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers did not process both bindings");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), run).await.expect("controller did not stop").unwrap();
    assert!(h.ctl.queue().is_shutting_down());
}
