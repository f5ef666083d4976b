//! Informer: a cache plus the event handlers notified after each delivered delta.

use std::sync::{Arc, PoisonError, RwLock};

use pcl_core::{Delta, Keyed};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Cache;

/// Callbacks fired after the cache has absorbed a change.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, obj: &T);
}

/// Routes all three notifications into one closure (the usual "enqueue" handler).
pub struct OnAnyChange<F>(pub F);

impl<T, F> EventHandler<T> for OnAnyChange<F>
where
    F: Fn(&T) + Send + Sync,
{
    fn on_add(&self, obj: &T) { (self.0)(obj) }
    fn on_update(&self, _old: &T, new: &T) { (self.0)(new) }
    fn on_delete(&self, obj: &T) { (self.0)(obj) }
}

pub struct Informer<T> {
    cache: Arc<Cache<T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
}

impl<T: Keyed + Send + Sync + 'static> Informer<T> {
    pub fn new(kind: &'static str) -> Self {
        Self { cache: Arc::new(Cache::new(kind)), handlers: RwLock::new(Vec::new()) }
    }

    pub fn cache(&self) -> &Arc<Cache<T>> { &self.cache }

    /// Register a handler. Objects already cached are replayed to it as adds.
    ///
    /// The handlers lock is held across the replay, so a concurrent `deliver` either
    /// lands in the listed snapshot or sees the new handler; possibly both, never neither.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for obj in self.cache.list() {
            handler.on_add(&obj);
        }
        handlers.push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply one delta to the cache, then notify handlers outside the cache lock.
    /// Handlers are read after the cache write.
    pub fn deliver(&self, delta: Delta<T>) {
        match delta {
            Delta::Applied(obj) => {
                let (new, old) = self.cache.upsert(obj);
                for h in &self.handlers() {
                    match &old {
                        Some(old) => h.on_update(old, &new),
                        None => h.on_add(&new),
                    }
                }
            }
            Delta::Deleted(obj) => {
                let removed = self.cache.remove(&obj.object_key());
                for h in &self.handlers() {
                    h.on_delete(removed.as_deref().unwrap_or(&obj));
                }
            }
            Delta::Resynced(items) => {
                let (applied, removed) = self.cache.replace(items);
                debug!(kind = self.cache.kind(), applied = applied.len(), removed = removed.len(), "cache resynced");
                for h in &self.handlers() {
                    for gone in &removed {
                        h.on_delete(gone);
                    }
                    for (new, old) in &applied {
                        match old {
                            Some(old) => h.on_update(old, new),
                            None => h.on_add(new),
                        }
                    }
                }
            }
        }
    }
}

/// Spawn the single writer of an informer's cache. Returns the sender watchers feed.
pub fn spawn_ingest<T>(informer: Arc<Informer<T>>, cap: usize) -> (mpsc::Sender<Delta<T>>, JoinHandle<()>)
where
    T: Keyed + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Delta<T>>(cap);
    let handle = tokio::spawn(async move {
        while let Some(delta) = rx.recv().await {
            informer.deliver(delta);
        }
        info!(kind = informer.cache().kind(), "ingest loop stopped");
    });
    (tx, handle)
}
