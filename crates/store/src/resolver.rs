//! Cross-scope reference resolution: tenant-local index first, global index second.

use std::sync::Arc;

use pcl_core::{path_name_key, Keyed, ReconcileError, ReferenceTarget, StoreError};

use crate::cache::{Cache, IndexError};
use crate::indexers::BY_LOGICAL_CLUSTER_PATH_AND_NAME;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("{count} objects match {key:?}")]
    Ambiguous { key: String, count: usize },
}

impl From<ResolveError> for ReconcileError {
    fn from(e: ResolveError) -> Self { ReconcileError::Store(StoreError::Transient(e.to_string())) }
}

/// Look up `index` on `local`; on a miss look up the same index on `global`.
pub fn by_index_with_fallback<T: Keyed>(
    local: &Cache<T>,
    global: &Cache<T>,
    index: &str,
    value: &str,
) -> Result<Vec<Arc<T>>, IndexError> {
    let hits = local.by_index(index, value)?;
    if !hits.is_empty() {
        return Ok(hits);
    }
    global.by_index(index, value)
}

/// Absent in both tiers is `Ok(None)`, not an error.
pub fn by_path_and_name_with_fallback<T: Keyed>(
    local: &Cache<T>,
    global: &Cache<T>,
    path: &str,
    name: &str,
) -> Result<Option<Arc<T>>, ResolveError> {
    let key = path_name_key(path, name);
    let mut hits = by_index_with_fallback(local, global, BY_LOGICAL_CLUSTER_PATH_AND_NAME, &key)?;
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.pop()),
        count => Err(ResolveError::Ambiguous { key, count }),
    }
}

/// Handle pairing a tenant-local cache with the process-wide one.
pub struct CrossScopeResolver<T> {
    local: Arc<Cache<T>>,
    global: Arc<Cache<T>>,
}

impl<T: Keyed> CrossScopeResolver<T> {
    pub fn new(local: Arc<Cache<T>>, global: Arc<Cache<T>>) -> Self { Self { local, global } }

    pub fn resolve(&self, target: &ReferenceTarget) -> Result<Option<Arc<T>>, ResolveError> {
        by_path_and_name_with_fallback(&self.local, &self.global, &target.path, &target.name)
    }
}

impl<T> Clone for CrossScopeResolver<T> {
    fn clone(&self) -> Self { Self { local: Arc::clone(&self.local), global: Arc::clone(&self.global) } }
}
