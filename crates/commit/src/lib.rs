//! pcl commit engine.
//!
//! A reconcile produces a mutated copy of a cached object. The committer compares it
//! with the untouched copy and, for each channel that differs, sends one JSON merge
//! patch carrying only the changed fields plus `uid`/`resourceVersion` preconditions.

#![forbid(unsafe_code)]

pub mod committer;
pub mod merge;

pub use committer::{channel_patch, Channel, CommitError, Committer, Patcher};
pub use merge::merge_patch;
