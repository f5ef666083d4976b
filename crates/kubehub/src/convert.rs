//! DynamicObject → typed `Resource<S, T>`.

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use pcl_core::{ObjectMeta, Resource, TenantId};
use serde::de::DeserializeOwned;

/// How an object's tenant is derived from its metadata.
#[derive(Debug, Clone)]
pub struct Tenancy {
    /// Annotation holding the tenant (logical cluster) name.
    pub annotation: String,
    /// Tenant for objects without the annotation.
    pub default_tenant: TenantId,
}

impl Tenancy {
    pub fn tenant_of(&self, meta: &kube::core::ObjectMeta) -> TenantId {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(&self.annotation))
            .and_then(|t| TenantId::new(t.as_str()).ok())
            .unwrap_or_else(|| self.default_tenant.clone())
    }
}

fn section<V: DeserializeOwned + Default>(obj: &DynamicObject, field: &str) -> Result<V> {
    match obj.data.get(field) {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone()).with_context(|| format!("decoding {field}")),
        _ => Ok(V::default()),
    }
}

pub fn resource_from_dynamic<S, T>(obj: &DynamicObject, tenancy: &Tenancy) -> Result<Resource<S, T>>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
{
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let mut meta = ObjectMeta::new(tenancy.tenant_of(&obj.metadata), name);
    meta.namespace = obj.metadata.namespace.clone();
    meta.uid = obj.metadata.uid.clone();
    meta.resource_version = obj.metadata.resource_version.clone();
    meta.labels = obj.metadata.labels.clone().unwrap_or_default();
    meta.annotations = obj.metadata.annotations.clone().unwrap_or_default();
    let spec = section(obj, "spec").with_context(|| format!("object {}", meta.name))?;
    let status = section(obj, "status").with_context(|| format!("object {}", meta.name))?;
    Ok(Resource { meta, spec, status })
}
