//! pcl controller: keeps objects claimed by an APIExport labeled for every APIBinding
//! that accepted the claim.

#![forbid(unsafe_code)]

pub mod claims;
pub mod config;
pub mod controller;
pub mod reconcile;

pub use claims::{claim_label, ClaimLabel, ClaimLabeler, PermissionClaimLabelReconciler, CLAIM_LABEL_PREFIX};
pub use config::ControllerConfig;
pub use controller::{install_indexers, Controller, CONTROLLER_NAME};
pub use reconcile::Reconcile;
