//! Two-channel commit: spec-side fields and status are diffed and patched separately.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use pcl_core::{AggregateError, Keyed, ObjectKey, ReconcileError, Resource, StoreError};
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::merge::{merge_patch, set_metadata_field};

/// Disjoint projections of an object, each with its own writer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `metadata.labels`, `metadata.annotations` and `spec`.
    Spec,
    /// `status`, written through the status subresource.
    Status,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Spec => "spec",
            Channel::Status => "status",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("encoding {channel} projection of {key}: {source}")]
    Encode {
        channel: Channel,
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CommitError> for ReconcileError {
    fn from(e: CommitError) -> Self { ReconcileError::failed(e.to_string()) }
}

/// Write side of the external store: one merge patch against one channel of one object.
#[async_trait]
pub trait Patcher: Send + Sync {
    /// Returns the object's resourceVersion after the write, when the store reports one.
    async fn patch(&self, key: &ObjectKey, channel: Channel, patch: Json) -> Result<Option<String>, StoreError>;
}

fn project<S: Serialize, T: Serialize>(obj: &Resource<S, T>, channel: Channel) -> Result<Json, CommitError> {
    let encode = |source: serde_json::Error| CommitError::Encode { channel, key: obj.object_key(), source };
    match channel {
        Channel::Spec => Ok(json!({
            "metadata": {
                "labels": serde_json::to_value(&obj.meta.labels).map_err(encode)?,
                "annotations": serde_json::to_value(&obj.meta.annotations).map_err(encode)?,
            },
            "spec": serde_json::to_value(&obj.spec).map_err(encode)?,
        })),
        Channel::Status => Ok(json!({ "status": serde_json::to_value(&obj.status).map_err(encode)? })),
    }
}

/// Minimal merge patch for one channel, with `old`'s uid and resourceVersion attached
/// as preconditions. `None` when the projections are equal.
pub fn channel_patch<S, T>(old: &Resource<S, T>, new: &Resource<S, T>, channel: Channel) -> Result<Option<Json>, CommitError>
where
    S: Serialize,
    T: Serialize,
{
    let Some(mut patch) = merge_patch(&project(old, channel)?, &project(new, channel)?) else {
        return Ok(None);
    };
    if let Some(uid) = old.meta.uid.as_deref() {
        set_metadata_field(&mut patch, "uid", uid);
    }
    if let Some(rv) = old.meta.resource_version.as_deref() {
        set_metadata_field(&mut patch, "resourceVersion", rv);
    }
    Ok(Some(patch))
}

/// Diffs a reconcile's before/after snapshots and writes each dirty channel once.
pub struct Committer {
    patcher: Arc<dyn Patcher>,
}

impl Clone for Committer {
    fn clone(&self) -> Self { Self { patcher: Arc::clone(&self.patcher) } }
}

impl Committer {
    pub fn new(patcher: Arc<dyn Patcher>) -> Self { Self { patcher } }

    /// Attempt both channels; failures are aggregated after both attempts. A conflict
    /// is returned, never retried here. A successful spec write hands its new
    /// resourceVersion to the status patch as the precondition.
    pub async fn commit<S, T>(&self, old: &Resource<S, T>, new: &Resource<S, T>) -> Result<(), ReconcileError>
    where
        S: Serialize + Sync,
        T: Serialize + Sync,
    {
        let key = old.object_key();
        let mut errs = Vec::new();
        let mut written_rv: Option<String> = None;
        for channel in [Channel::Spec, Channel::Status] {
            let res = self.commit_channel(&key, old, new, channel, written_rv.as_deref()).await;
            match res {
                Ok(Some(rv)) => written_rv = Some(rv),
                Ok(None) => {}
                Err(e) => errs.push(e),
            }
        }
        AggregateError::flatten(errs)
    }

    async fn commit_channel<S, T>(
        &self,
        key: &ObjectKey,
        old: &Resource<S, T>,
        new: &Resource<S, T>,
        channel: Channel,
        resource_version: Option<&str>,
    ) -> Result<Option<String>, ReconcileError>
    where
        S: Serialize + Sync,
        T: Serialize + Sync,
    {
        let Some(mut patch) = channel_patch(old, new, channel)? else {
            return Ok(None);
        };
        if let Some(rv) = resource_version {
            set_metadata_field(&mut patch, "resourceVersion", rv);
        }
        debug!(key = %key, %channel, patch = %patch, "patching");
        let t0 = Instant::now();
        let res = self.patcher.patch(key, channel, patch).await;
        histogram!("commit_patch_ms", t0.elapsed().as_secs_f64() * 1000.0, "channel" => channel.as_str());
        match res {
            Ok(rv) => {
                counter!("commit_patches_total", 1u64, "channel" => channel.as_str());
                Ok(rv)
            }
            Err(e) => {
                counter!("commit_patch_errors_total", 1u64, "channel" => channel.as_str());
                warn!(key = %key, %channel, error = %e, "patch failed");
                Err(e.into())
            }
        }
    }
}
