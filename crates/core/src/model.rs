//! Resource model: metadata, the spec/status split and the claim types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::key::{Keyed, ObjectKey, TenantId};

/// Annotation carrying the canonical (human readable) path of an object's tenant.
pub const PATH_ANNOTATION: &str = "kcp.io/path";

/// Condition type owned by the permission-claim label predicate.
pub const CONDITION_PERMISSION_CLAIMS_APPLIED: &str = "PermissionClaimsApplied";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub tenant: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(tenant: TenantId, name: impl Into<String>) -> Self {
        Self {
            tenant,
            namespace: None,
            name: name.into(),
            uid: None,
            resource_version: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Canonical path from [`PATH_ANNOTATION`], if set.
    pub fn path(&self) -> Option<&str> {
        self.annotations.get(PATH_ANNOTATION).map(String::as_str).filter(|p| !p.is_empty())
    }
}

/// A managed object: metadata plus a spec section and a status section, each with
/// its own set of writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource<S, T> {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: S,
    #[serde(default)]
    pub status: T,
}

impl<S, T> Keyed for Resource<S, T> {
    fn object_key(&self) -> ObjectKey {
        ObjectKey {
            tenant: self.meta.tenant.clone(),
            namespace: self.meta.namespace.clone(),
            name: self.meta.name.clone(),
        }
    }
}

/// Change notification delivered by a watch.
#[derive(Debug, Clone)]
pub enum Delta<T> {
    Applied(T),
    Deleted(T),
    /// Full relist after a watch restart; anything absent was deleted.
    Resynced(Vec<T>),
}

/// Object addressed by a location hint (possibly an ancestor scope) plus a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceTarget {
    pub path: String,
    pub name: String,
}

impl ReferenceTarget {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self { path: path.into(), name: name.into() }
    }

    /// Index key used by the path-and-name indexes.
    pub fn index_key(&self) -> String { path_name_key(&self.path, &self.name) }
}

pub fn path_name_key(path: &str, name: &str) -> String { format!("{path}|{name}") }

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionClaim {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_hash: String,
}

impl PermissionClaim {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), resource: resource.into(), identity_hash: String::new() }
    }

    pub fn group_resource(&self) -> GroupResource {
        GroupResource { group: self.group.clone(), resource: self.resource.clone() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AcceptanceState {
    Accepted,
    #[default]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptablePermissionClaim {
    #[serde(flatten)]
    pub claim: PermissionClaim,
    #[serde(default)]
    pub state: AcceptanceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExportBindingReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BindingReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportBindingReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiBindingSpec {
    #[serde(default)]
    pub reference: BindingReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_claims: Vec<AcceptablePermissionClaim>,
}

impl ApiBindingSpec {
    /// Claims the binding owner agreed to.
    pub fn accepted_claims(&self) -> SmallVec<[&PermissionClaim; 4]> {
        self.permission_claims
            .iter()
            .filter(|c| c.state == AcceptanceState::Accepted)
            .map(|c| &c.claim)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiBindingStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_permission_claims: Vec<PermissionClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_permission_claims: Vec<PermissionClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_claims: Vec<PermissionClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_hash: String,
}

pub type ApiBinding = Resource<ApiBindingSpec, ApiBindingStatus>;
pub type ApiExport = Resource<ApiExportSpec, ApiExportStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: String,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus) -> Self {
        Self { type_: type_.to_string(), status, reason: None, message: None, last_transition_time: String::new() }
    }

    pub fn with_reason(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
        self
    }
}

/// Upsert a condition by type. The transition time only moves when the status
/// changes, so re-setting an identical condition leaves the list untouched.
pub fn set_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(cur) if cur.status == next.status => {
            cur.reason = next.reason;
            cur.message = next.message;
        }
        Some(cur) => {
            next.last_transition_time = now_rfc3339();
            *cur = next;
        }
        None => {
            next.last_transition_time = now_rfc3339();
            conditions.push(next);
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
