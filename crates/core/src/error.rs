//! Error taxonomy shared by the cache, commit engine and workers.

use std::fmt;

/// A queue token that was not produced by `ObjectKey::encode`. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed key {key:?}: {reason}")]
pub struct MalformedKeyError {
    pub key: String,
    pub reason: &'static str,
}

impl MalformedKeyError {
    pub fn new(key: impl Into<String>, reason: &'static str) -> Self {
        Self { key: key.into(), reason }
    }
}

/// Failures reported by the external object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// The stored object's version moved since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
}

/// Errors produced during one reconcile-and-commit cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl ReconcileError {
    pub fn failed(msg: impl Into<String>) -> Self { Self::Failed(msg.into()) }

    /// True when any contained store error is a version conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict(),
            Self::Failed(_) => false,
            Self::Aggregate(agg) => agg.errors().iter().any(|e| e.is_conflict()),
        }
    }
}

/// Several independent failures reported upward as one.
#[derive(Debug)]
pub struct AggregateError(Vec<ReconcileError>);

impl AggregateError {
    /// Zero errors → `Ok`, one error → that error, more → an aggregate.
    pub fn flatten(mut errs: Vec<ReconcileError>) -> Result<(), ReconcileError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(ReconcileError::Aggregate(AggregateError(errs))),
        }
    }

    pub fn errors(&self) -> &[ReconcileError] { &self.0 }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 { f.write_str(", ")?; }
            write!(f, "{e}")?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregateError {}
