use async_trait::async_trait;
use pcl_core::{ApiBinding, ReconcileError};

/// The pluggable reconcile step. Mutates the working copy of a binding; the caller
/// owns the untouched snapshot and commits the difference afterwards.
///
/// Errors are returned after the caller has still committed whatever the step
/// managed to change, so partial status progress is never lost.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, binding: &mut ApiBinding) -> Result<(), ReconcileError>;
}
