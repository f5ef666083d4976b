use kube::core::{ApiResource, GroupVersionKind};

pub const APIS_GROUP: &str = "apis.kcp.io";
pub const APIS_VERSION: &str = "v1alpha2";

pub fn api_binding_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(APIS_GROUP, APIS_VERSION, "APIBinding"), "apibindings")
}

pub fn api_export_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(APIS_GROUP, APIS_VERSION, "APIExport"), "apiexports")
}
