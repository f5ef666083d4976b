//! Named index functions installed on the caches at bootstrap.

use pcl_core::{path_name_key, ApiBinding, GroupResource, Resource, TenantId};

/// Objects by `<tenant>|<name>` and, when annotated, by `<canonical path>|<name>`.
pub const BY_LOGICAL_CLUSTER_PATH_AND_NAME: &str = "ByLogicalClusterPathAndName";

/// Bindings by `<tenant>|<group resource>` for every accepted permission claim.
pub const BINDING_BY_CLUSTER_AND_ACCEPTED_CLAIMED_GROUP_RESOURCES: &str =
    "APIBindingByClusterAndAcceptedClaimedGroupResources";

/// Bindings by `<path or tenant>|<export name>` of the export they reference.
pub const BINDINGS_BY_API_EXPORT: &str = "APIBindingsByAPIExport";

pub fn index_by_logical_cluster_path_and_name<S, T>(obj: &Resource<S, T>) -> Vec<String> {
    let mut keys = vec![path_name_key(obj.meta.tenant.as_str(), &obj.meta.name)];
    if let Some(path) = obj.meta.path() {
        if path != obj.meta.tenant.as_str() {
            keys.push(path_name_key(path, &obj.meta.name));
        }
    }
    keys
}

pub fn claimed_group_resource_key(tenant: &TenantId, gr: &GroupResource) -> String {
    format!("{tenant}|{gr}")
}

pub fn index_binding_by_cluster_and_accepted_claimed_group_resources(binding: &ApiBinding) -> Vec<String> {
    let mut keys: Vec<String> = binding
        .spec
        .accepted_claims()
        .iter()
        .map(|c| claimed_group_resource_key(&binding.meta.tenant, &c.group_resource()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

pub fn index_bindings_by_api_export(binding: &ApiBinding) -> Vec<String> {
    let Some(export) = binding.spec.reference.export.as_ref() else { return Vec::new() };
    let path = if export.path.is_empty() { binding.meta.tenant.as_str() } else { export.path.as_str() };
    vec![path_name_key(path, &export.name)]
}
