//! Thread-safe object cache with named secondary indexes.
//!
//! Written only by the watch-delivery path; read by every worker. Index entries are
//! updated under the same write lock as the object itself, so a delete never leaves
//! a stale key behind in any index.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pcl_core::{Keyed, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};

/// Computes the index values an object is filed under.
pub type IndexFunc<T> = fn(&T) -> Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("indexer {0:?} already registered")]
    Conflict(String),
    #[error("index {0:?} does not exist")]
    Unknown(String),
}

type Index = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<T> {
    items: FxHashMap<ObjectKey, Arc<T>>,
    indexers: FxHashMap<&'static str, IndexFunc<T>>,
    indices: FxHashMap<&'static str, Index>,
}

impl<T> Inner<T> {
    fn index_insert(&mut self, key: &ObjectKey, obj: &T) {
        for (name, func) in self.indexers.iter() {
            let index = self.indices.entry(*name).or_default();
            for value in func(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn index_remove(&mut self, key: &ObjectKey, obj: &T) {
        for (name, func) in self.indexers.iter() {
            let Some(index) = self.indices.get_mut(name) else { continue };
            for value in func(obj) {
                if let Some(set) = index.get_mut(&value) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

pub struct Cache<T> {
    kind: &'static str,
    inner: RwLock<Inner<T>>,
}

impl<T: Keyed> Cache<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: RwLock::new(Inner { items: FxHashMap::default(), indexers: FxHashMap::default(), indices: FxHashMap::default() }),
        }
    }

    pub fn kind(&self) -> &'static str { self.kind }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Register indexers. Fails without registering anything if any name is taken.
    /// Existing items are indexed immediately.
    pub fn add_indexers(&self, indexers: &[(&'static str, IndexFunc<T>)]) -> Result<(), IndexError> {
        let mut inner = self.write();
        if let Some((name, _)) = indexers.iter().find(|(name, _)| inner.indexers.contains_key(name)) {
            return Err(IndexError::Conflict((*name).to_string()));
        }
        for (name, func) in indexers {
            let mut index = Index::default();
            for (key, obj) in inner.items.iter() {
                for value in func(obj) {
                    index.entry(value).or_default().insert(key.clone());
                }
            }
            inner.indexers.insert(*name, *func);
            inner.indices.insert(*name, index);
        }
        Ok(())
    }

    /// Register only the indexers whose names are not taken yet.
    pub fn add_indexers_if_not_present(&self, indexers: &[(&'static str, IndexFunc<T>)]) -> Result<(), IndexError> {
        let missing: Vec<_> = {
            let inner = self.read();
            indexers.iter().filter(|(name, _)| !inner.indexers.contains_key(name)).copied().collect()
        };
        self.add_indexers(&missing)
    }

    /// Local read; never blocks on the network.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> { self.read().items.get(key).cloned() }

    /// Insert or replace, returning the stored value and the previous one.
    pub fn upsert(&self, obj: T) -> (Arc<T>, Option<Arc<T>>) {
        let key = obj.object_key();
        let obj = Arc::new(obj);
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        if let Some(prev) = &old {
            inner.index_remove(&key, prev);
        }
        inner.index_insert(&key, &obj);
        let len = inner.items.len();
        drop(inner);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.kind);
        (obj, old)
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<T>> {
        let mut inner = self.write();
        let old = inner.items.remove(key);
        if let Some(prev) = &old {
            inner.index_remove(key, prev);
        }
        let len = inner.items.len();
        drop(inner);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.kind);
        old
    }

    /// Replace the whole contents (watch relist). Returns `(stored, previous)` pairs for
    /// every listed object and the objects that vanished.
    #[allow(clippy::type_complexity)]
    pub fn replace(&self, items: Vec<T>) -> (Vec<(Arc<T>, Option<Arc<T>>)>, Vec<Arc<T>>) {
        let mut next: FxHashMap<ObjectKey, Arc<T>> = FxHashMap::default();
        for obj in items {
            next.insert(obj.object_key(), Arc::new(obj));
        }
        let mut inner = self.write();
        let stale: Vec<ObjectKey> = inner.items.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(prev) = inner.items.remove(&key) {
                inner.index_remove(&key, &prev);
                removed.push(prev);
            }
        }
        let mut applied = Vec::with_capacity(next.len());
        for (key, obj) in next {
            let old = inner.items.insert(key.clone(), Arc::clone(&obj));
            if let Some(prev) = &old {
                inner.index_remove(&key, prev);
            }
            inner.index_insert(&key, &obj);
            applied.push((obj, old));
        }
        let len = inner.items.len();
        drop(inner);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.kind);
        (applied, removed)
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>, IndexError> {
        let inner = self.read();
        if !inner.indexers.contains_key(index) {
            return Err(IndexError::Unknown(index.to_string()));
        }
        let mut keys: Vec<ObjectKey> = inner
            .indices
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Objects filed under `value` in `index`, ordered by key.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<T>>, IndexError> {
        let keys = self.index_keys(index, value)?;
        let inner = self.read();
        Ok(keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    pub fn list(&self) -> Vec<Arc<T>> { self.read().items.values().cloned().collect() }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcl_core::TenantId;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj { tenant: &'static str, name: &'static str, tags: Vec<&'static str> }

    impl Keyed for Obj {
        fn object_key(&self) -> ObjectKey {
            ObjectKey::cluster_scoped(TenantId::new(self.tenant).unwrap(), self.name).unwrap()
        }
    }

    fn by_tag(o: &Obj) -> Vec<String> { o.tags.iter().map(|t| format!("{}|{}", o.tenant, t)).collect() }

    fn obj(name: &'static str, tags: Vec<&'static str>) -> Obj { Obj { tenant: "t1", name, tags } }

    #[test]
    fn index_follows_updates_and_deletes() {
        let cache = Cache::new("obj");
        cache.add_indexers(&[("tag", by_tag)]).unwrap();
        cache.upsert(obj("a", vec!["x", "y"]));
        cache.upsert(obj("b", vec!["x"]));
        assert_eq!(cache.by_index("tag", "t1|x").unwrap().len(), 2);

        cache.upsert(obj("a", vec!["y"]));
        let xs = cache.by_index("tag", "t1|x").unwrap();
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].name, "b");

        let key = obj("b", vec![]).object_key();
        assert!(cache.remove(&key).is_some());
        assert!(cache.index_keys("tag", "t1|x").unwrap().is_empty());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn late_indexer_sees_existing_items() {
        let cache = Cache::new("obj");
        cache.upsert(obj("a", vec!["x"]));
        cache.add_indexers(&[("tag", by_tag)]).unwrap();
        assert_eq!(cache.index_keys("tag", "t1|x").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_indexer_is_rejected_but_if_not_present_is_idempotent() {
        let cache: Cache<Obj> = Cache::new("obj");
        cache.add_indexers(&[("tag", by_tag)]).unwrap();
        assert_eq!(cache.add_indexers(&[("tag", by_tag)]), Err(IndexError::Conflict("tag".into())));
        assert!(cache.add_indexers_if_not_present(&[("tag", by_tag)]).is_ok());
        assert!(matches!(cache.by_index("nope", "v"), Err(IndexError::Unknown(_))));
    }

    #[test]
    fn replace_drops_missing_objects_and_their_index_entries() {
        let cache = Cache::new("obj");
        cache.add_indexers(&[("tag", by_tag)]).unwrap();
        cache.upsert(obj("a", vec!["x"]));
        cache.upsert(obj("b", vec!["x"]));
        let (applied, removed) = cache.replace(vec![obj("b", vec!["z"]), obj("c", vec!["x"])]);
        assert_eq!(applied.len(), 2);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "a");
        let xs: Vec<_> = cache.by_index("tag", "t1|x").unwrap().iter().map(|o| o.name).collect();
        assert_eq!(xs, vec!["c"]);
        assert_eq!(cache.len(), 2);
    }
}
