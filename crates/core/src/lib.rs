//! pcl core types: tenant-scoped object keys, the resource model and the error taxonomy.

#![forbid(unsafe_code)]

pub mod error;
pub mod key;
pub mod model;

pub use error::{AggregateError, MalformedKeyError, ReconcileError, StoreError};
pub use key::{Keyed, ObjectKey, TenantId};
pub use model::{
    find_condition, path_name_key, set_condition, AcceptablePermissionClaim, AcceptanceState, ApiBinding,
    ApiBindingSpec, ApiBindingStatus, ApiExport, ApiExportSpec, ApiExportStatus, BindingReference, Condition,
    ConditionStatus, Delta, ExportBindingReference, GroupResource, ObjectMeta, PermissionClaim, ReferenceTarget,
    Resource, CONDITION_PERMISSION_CLAIMS_APPLIED, PATH_ANNOTATION,
};
