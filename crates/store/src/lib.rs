//! pcl store: watch-maintained caches with secondary indexes, informers and the
//! cross-scope resolver.

#![forbid(unsafe_code)]

pub mod cache;
pub mod indexers;
pub mod informer;
pub mod resolver;

pub use cache::{Cache, IndexError, IndexFunc};
pub use informer::{spawn_ingest, EventHandler, Informer, OnAnyChange};
pub use resolver::{by_index_with_fallback, by_path_and_name_with_fallback, CrossScopeResolver, ResolveError};
