//! Default reconcile step: keep claimed objects labeled for the exports their bindings accept.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use pcl_core::{
    set_condition, AggregateError, ApiBinding, ApiExport, Condition, ConditionStatus, PermissionClaim, ReconcileError,
    ReferenceTarget, StoreError, TenantId, CONDITION_PERMISSION_CLAIMS_APPLIED,
};
use pcl_store::CrossScopeResolver;
use sha2::{Digest, Sha224};
use tracing::{debug, warn};

use crate::reconcile::Reconcile;

pub const CLAIM_LABEL_PREFIX: &str = "claimed.internal.apis.kcp.io/";

pub const REASON_API_EXPORT_NOT_FOUND: &str = "APIExportNotFound";
pub const REASON_LABELING_FAILED: &str = "LabelingFailed";

/// Label marking an object as visible to an export through one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimLabel {
    pub key: String,
    pub value: String,
}

/// Stable label for (`export`, `claim`): SHA-224 over the export identity and the claim.
pub fn claim_label(export: &ApiExport, claim: &PermissionClaim) -> ClaimLabel {
    let mut h = Sha224::new();
    let parts = [
        export.meta.tenant.as_str(),
        export.meta.name.as_str(),
        claim.group.as_str(),
        claim.resource.as_str(),
        claim.identity_hash.as_str(),
    ];
    for part in parts {
        h.update(part.as_bytes());
        h.update([0u8]);
    }
    let digest = format!("{:x}", h.finalize());
    ClaimLabel { key: format!("{CLAIM_LABEL_PREFIX}{digest}"), value: digest }
}

/// Write access to the claimed objects of a tenant.
#[async_trait]
pub trait ClaimLabeler: Send + Sync {
    /// Set `label` on every object of the claimed resource in `tenant`. Idempotent.
    async fn label(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError>;
    /// Remove `label` from every object of the claimed resource in `tenant`. Idempotent.
    async fn unlabel(&self, tenant: &TenantId, claim: &PermissionClaim, label: &ClaimLabel) -> Result<(), StoreError>;
}

pub struct PermissionClaimLabelReconciler {
    exports: CrossScopeResolver<ApiExport>,
    labeler: Arc<dyn ClaimLabeler>,
}

impl PermissionClaimLabelReconciler {
    pub fn new(exports: CrossScopeResolver<ApiExport>, labeler: Arc<dyn ClaimLabeler>) -> Self { Self { exports, labeler } }
}

fn condition(status: ConditionStatus) -> Condition { Condition::new(CONDITION_PERMISSION_CLAIMS_APPLIED, status) }

#[async_trait]
impl Reconcile for PermissionClaimLabelReconciler {
    async fn reconcile(&self, binding: &mut ApiBinding) -> Result<(), ReconcileError> {
        let Some(export_ref) = binding.spec.reference.export.clone() else {
            return Ok(());
        };
        let path = if export_ref.path.is_empty() { binding.meta.tenant.to_string() } else { export_ref.path.clone() };
        let target = ReferenceTarget::new(path, export_ref.name.clone());

        let Some(export) = self.exports.resolve(&target)? else {
            debug!(export = %target.index_key(), "export not found");
            set_condition(
                &mut binding.status.conditions,
                condition(ConditionStatus::False)
                    .with_reason(REASON_API_EXPORT_NOT_FOUND, format!("APIExport {} not found", target.index_key())),
            );
            return Ok(());
        };

        binding.status.export_permission_claims = export.spec.permission_claims.clone();

        let offered: BTreeSet<&PermissionClaim> = export.spec.permission_claims.iter().collect();
        let matched: BTreeSet<PermissionClaim> =
            binding.spec.accepted_claims().into_iter().filter(|c| offered.contains(c)).cloned().collect();
        let applied: BTreeSet<PermissionClaim> = binding.status.applied_permission_claims.iter().cloned().collect();

        let tenant = binding.meta.tenant.clone();
        let mut next: BTreeSet<PermissionClaim> = applied.intersection(&matched).cloned().collect();
        let mut errs = Vec::new();

        for claim in matched.difference(&applied) {
            let label = claim_label(&export, claim);
            match self.labeler.label(&tenant, claim, &label).await {
                Ok(()) => {
                    next.insert(claim.clone());
                }
                Err(e) => {
                    warn!(tenant = %tenant, claim = %claim.group_resource(), error = %e, "labeling claimed objects failed");
                    errs.push(ReconcileError::from(e));
                }
            }
        }
        for claim in applied.difference(&matched) {
            let label = claim_label(&export, claim);
            if let Err(e) = self.labeler.unlabel(&tenant, claim, &label).await {
                warn!(tenant = %tenant, claim = %claim.group_resource(), error = %e, "unlabeling claimed objects failed");
                next.insert(claim.clone());
                errs.push(ReconcileError::from(e));
            }
        }

        binding.status.applied_permission_claims = next.into_iter().collect();

        if errs.is_empty() {
            set_condition(&mut binding.status.conditions, condition(ConditionStatus::True));
            return Ok(());
        }
        let res = AggregateError::flatten(errs);
        let msg = res.as_ref().err().map(ToString::to_string).unwrap_or_default();
        set_condition(
            &mut binding.status.conditions,
            condition(ConditionStatus::False).with_reason(REASON_LABELING_FAILED, msg),
        );
        res
    }
}
