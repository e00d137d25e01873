//! Thread-safe object cache with secondary indices.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use api_types::Resource;
use error_stack::Report;

use crate::error::ClientError;
use crate::error::ClientResult;

/// Name of the index every informer installs.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Computes the index values an object is filed under.
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

pub type Indexers<T> = HashMap<String, IndexFunc<T>>;

/// Indexes objects by their (defaulted) namespace.
pub fn namespace_index_func<T: Resource>() -> IndexFunc<T> {
    Arc::new(|obj: &T| vec![obj.meta().namespace_or_default().to_string()])
}

/// How the cache changed during [`Indexer::replace`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    Deleted(Arc<T>),
}

pub struct Indexer<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    items: BTreeMap<String, Arc<T>>,
    indexers: Indexers<T>,
    /// index name -> index value -> object keys
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl<T: Resource> Default for Indexer<T> {
    fn default() -> Self {
        Self::new(Indexers::new())
    }
}

impl<T: Resource> Indexer<T> {
    pub fn new(indexers: Indexers<T>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: BTreeMap::new(),
                indexers,
                indices: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces `obj`, returning the previous version.
    pub fn add(&self, obj: T) -> Option<Arc<T>> {
        self.write().upsert(Arc::new(obj))
    }

    pub fn update(&self, obj: T) -> Option<Arc<T>> {
        self.add(obj)
    }

    /// Removes the object with `key`, returning it if it was cached.
    pub fn delete(&self, key: &str) -> Option<Arc<T>> {
        self.write().remove(key)
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.read().items.get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().items.values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps the whole content for `items` and reports what changed.
    ///
    /// Objects whose resource version did not change produce no delta.
    pub fn replace(&self, items: Vec<T>) -> Vec<Delta<T>> {
        let mut inner = self.write();
        let mut deltas = Vec::new();
        let mut seen = BTreeSet::new();
        for obj in items {
            let obj = Arc::new(obj);
            let key = obj.key();
            seen.insert(key.clone());
            match inner.items.get(&key).cloned() {
                Some(old) if old.resource_version() == obj.resource_version() => {}
                Some(old) => {
                    inner.upsert(obj.clone());
                    deltas.push(Delta::Updated { old, new: obj });
                }
                None => {
                    inner.upsert(obj.clone());
                    deltas.push(Delta::Added(obj));
                }
            }
        }
        let gone: Vec<String> = inner
            .items
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in gone {
            if let Some(old) = inner.remove(&key) {
                deltas.push(Delta::Deleted(old));
            }
        }
        deltas
    }

    /// Objects filed under `value` in index `index_name`.
    pub fn by_index(&self, index_name: &str, value: &str) -> ClientResult<Vec<Arc<T>>> {
        let inner = self.read();
        if !inner.indexers.contains_key(index_name) {
            return Err(Report::new(ClientError::UnknownIndex(index_name.to_string())));
        }
        let keys = inner
            .indices
            .get(index_name)
            .and_then(|index| index.get(value));
        Ok(keys
            .into_iter()
            .flatten()
            .filter_map(|key| inner.items.get(key).cloned())
            .collect())
    }

    /// Adds indexers; names already registered keep their existing function.
    /// Cached objects are indexed immediately.
    pub fn add_indexers(&self, indexers: Indexers<T>) {
        let mut inner = self.write();
        for (name, func) in indexers {
            if inner.indexers.contains_key(&name) {
                continue;
            }
            let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
            for (key, obj) in &inner.items {
                for value in func(obj.as_ref()) {
                    index.entry(value).or_default().insert(key.clone());
                }
            }
            inner.indices.insert(name.clone(), index);
            inner.indexers.insert(name, func);
        }
    }

    pub fn has_index(&self, index_name: &str) -> bool {
        self.read().indexers.contains_key(index_name)
    }
}

impl<T: Resource> Inner<T> {
    fn upsert(&mut self, obj: Arc<T>) -> Option<Arc<T>> {
        let key = obj.key();
        let old = self.items.insert(key.clone(), obj.clone());
        if let Some(old) = &old {
            self.unindex(&key, old);
        }
        self.index(&key, &obj);
        old
    }

    fn remove(&mut self, key: &str) -> Option<Arc<T>> {
        let old = self.items.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn index(&mut self, key: &str, obj: &T) {
        for (name, func) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in func(obj) {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, obj: &T) {
        for (name, func) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in func(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}
