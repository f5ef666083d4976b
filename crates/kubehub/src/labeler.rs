//! Labels the objects of a claimed resource inside one tenant.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use pcl_controller::{ClaimLabel, ClaimLabeler};
use pcl_core::{GroupResource, PermissionClaim, StoreError, TenantId};
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clients::TenantClients;
use crate::patcher::store_error;

/// Memoized lookups. The lock is only held to read or insert, never while a lookup
/// is running, so concurrent misses on different keys proceed in parallel.
struct Memo<K, V> {
    entries: Mutex<FxHashMap<K, V>>,
}

impl<K: Eq + Hash, V: Clone> Memo<K, V> {
    fn new() -> Self { Self { entries: Mutex::new(FxHashMap::default()) } }

    async fn get_or_try_insert<E, F, Fut>(&self, key: K, lookup: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.entries.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let found = lookup().await?;
        self.entries.lock().await.insert(key, found.clone());
        Ok(found)
    }
}

pub struct KubeClaimLabeler {
    clients: Arc<TenantClients>,
    field_manager: String,
    resources: Memo<(TenantId, GroupResource), (ApiResource, bool)>,
}

impl KubeClaimLabeler {
    pub fn new(clients: Arc<TenantClients>, field_manager: impl Into<String>) -> Self {
        Self { clients, field_manager: field_manager.into(), resources: Memo::new() }
    }

    async fn find_api_resource(&self, client: Client, tenant: &TenantId, gr: &GroupResource) -> Result<(ApiResource, bool), StoreError> {
        self.resources.get_or_try_insert((tenant.clone(), gr.clone()), || discover(client, tenant, gr)).await
    }

    /// Merge-patch `labels` onto every listed object matching `selector`.
    async fn patch_all(
        &self,
        tenant: &TenantId,
        claim: &PermissionClaim,
        selector: Option<&str>,
        skip: impl Fn(&DynamicObject) -> bool + Send + Sync,
        labels: serde_json::Value,
    ) -> Result<usize, StoreError> {
        let gr = claim.group_resource();
        let client = self.clients.for_tenant(tenant).map_err(|e| StoreError::Transient(format!("{e:#}")))?;
        let (ar, namespaced) = self.find_api_resource(client.clone(), tenant, &gr).await?;
        let lp = match selector {
            Some(s) => ListParams::default().labels(s),
            None => ListParams::default(),
        };
        let list = Api::<DynamicObject>::all_with(client.clone(), &ar)
            .list(&lp)
            .await
            .map_err(|e| store_error(&format!("listing {gr} in {tenant}"), e))?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let patch = json!({ "metadata": { "labels": labels } });
        let mut patched = 0;
        for obj in list.items.iter().filter(|o| !skip(*o)) {
            let Some(name) = obj.metadata.name.as_deref() else { continue };
            let api: Api<DynamicObject> = match (namespaced, obj.metadata.namespace.as_deref()) {
                (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
                _ => Api::all_with(client.clone(), &ar),
            };
            api.patch(name, &pp, &Patch::Merge(&patch)).await.map_err(|e| store_error(&format!("{gr} {name}"), e))?;
            patched += 1;
        }
        counter!("claim_label_patches_total", patched as u64);
        debug!(tenant = %tenant, resource = %gr, patched, "claimed objects patched");
        Ok(patched)
    }
}

async fn discover(client: Client, tenant: &TenantId, gr: &GroupResource) -> Result<(ApiResource, bool), StoreError> {
    let discovery = Discovery::new(client)
        .filter(&[gr.group.as_str()])
        .run()
        .await
        .map_err(|e| store_error(&format!("discovering {gr}"), e))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gr.group && ar.plural == gr.resource {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(StoreError::NotFound(format!("resource {gr} not served in {tenant}")))
}

fn has_label(obj: &DynamicObject, label: &ClaimLabel) -> bool {
    obj.metadata.labels.as_ref().and_then(|l| l.get(&label.key)) == Some(&label.value)
}

#[async_trait]
impl ClaimLabeler for KubeClaimLabeler {
    async fn label(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError> {
        self.patch_all(tenant, claim, None, |o| has_label(o, label), json!({ label.key.clone(): label.value })).await?;
        Ok(())
    }

    async fn unlabel(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError> {
        self.patch_all(tenant, claim, Some(&label.key), |_| false, json!({ label.key.clone(): null })).await?;
        Ok(())
    }
}
