//! pcl kubehub: kube-rs wiring for the controller.

#![forbid(unsafe_code)]

pub mod clients;
pub mod convert;
pub mod labeler;
pub mod patcher;
pub mod resources;
pub mod watch;

pub use clients::TenantClients;
pub use convert::{resource_from_dynamic, Tenancy};
pub use labeler::KubeClaimLabeler;
pub use patcher::{store_error, KubePatcher};
pub use resources::{api_binding_resource, api_export_resource};
pub use watch::start_watcher;
