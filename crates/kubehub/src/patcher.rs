use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
};
use pcl_commit::{Channel, Patcher};
use pcl_core::{ObjectKey, StoreError};
use serde_json::Value as Json;

use crate::clients::TenantClients;

/// Map an API error onto the store error taxonomy.
pub fn store_error(what: &str, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{what}: {}", ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(format!("{what}: {}", ae.message)),
        _ => StoreError::Transient(format!("{what}: {e}")),
    }
}

/// Sends commit patches as JSON merge patches; the status channel goes to the
/// status subresource.
pub struct KubePatcher {
    clients: Arc<TenantClients>,
    resource: ApiResource,
    field_manager: String,
}

impl KubePatcher {
    pub fn new(clients: Arc<TenantClients>, resource: ApiResource, field_manager: impl Into<String>) -> Self {
        Self { clients, resource, field_manager: field_manager.into() }
    }
}

#[async_trait]
impl Patcher for KubePatcher {
    async fn patch(&self, key: &ObjectKey, channel: Channel, patch: Json) -> Result<Option<String>, StoreError> {
        let client = self.clients.for_tenant(&key.tenant).map_err(|e| StoreError::Transient(format!("{e:#}")))?;
        let api: Api<DynamicObject> = match key.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &self.resource),
            None => Api::all_with(client, &self.resource),
        };
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let res = match channel {
            Channel::Spec => api.patch(&key.name, &pp, &Patch::Merge(&patch)).await,
            Channel::Status => api.patch_status(&key.name, &pp, &Patch::Merge(&patch)).await,
        };
        res.map(|obj| obj.metadata.resource_version).map_err(|e| store_error(&key.encode(), e))
    }
}
