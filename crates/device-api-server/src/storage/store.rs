use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use api_types::Resource;
use api_types::DEFAULT_NAMESPACE;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use prometheus::IntCounter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::watch::WatcherRegistry;
use super::Backend;
use super::EventKind;
use super::KeyBuilder;
use super::RawEvent;
use super::Revision;
use super::StorageError;
use super::StorageResult;
use super::WatchEvent;
use super::WatchStart;
use super::WatchStream;

/// Events buffered per watch stream before the watcher is evicted.
pub const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Typed storage for one resource kind on one node.
///
/// Writes are serialised and their events are published before the write
/// lock is released, so every watcher observes a single global order that
/// matches revision order.
pub struct Store<T: Resource> {
    backend: Arc<dyn Backend>,
    keys: KeyBuilder,
    watchers: Arc<WatcherRegistry<T>>,
    write_lock: Mutex<()>,
    evictions: Option<IntCounter>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Store<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn Backend>, node_name: &str) -> Self {
        Self {
            backend,
            keys: KeyBuilder::new(node_name, &T::DESCRIPTOR),
            watchers: Arc::new(WatcherRegistry::new(WATCH_CHANNEL_CAPACITY)),
            write_lock: Mutex::new(()),
            evictions: None,
            _kind: PhantomData,
        }
    }

    /// Counts watchers evicted for falling behind.
    pub fn with_eviction_counter(mut self, counter: IntCounter) -> Self {
        self.evictions = Some(counter);
        self
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub async fn current_revision(&self) -> StorageResult<Revision> {
        self.backend.current_revision().await
    }

    /// Revision up to which every committed write has been handed to
    /// watchers.
    pub async fn published_revision(&self) -> StorageResult<Revision> {
        let _guard = self.write_lock.lock().await;
        self.backend.current_revision().await
    }

    /// Fetches one object. The latest value always satisfies a hint that is
    /// not ahead of the store.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get(&self, namespace: &str, name: &str, hint: Option<Revision>) -> StorageResult<T> {
        let key = self.keys.object(namespace, name);
        let kv = self.backend.get(&key).await?;
        let Some(kv) = kv else {
            self.check_hint(hint).await?;
            return Err(Report::new(StorageError::NotFound { key }));
        };
        if let Some(requested) = hint.filter(|h| *h > kv.mod_revision) {
            self.check_hint(Some(requested)).await?;
        }
        decode(&kv.value, kv.mod_revision)
    }

    /// Lists a namespace, or the whole node for `None`, at one revision.
    ///
    /// An empty prefix is not an error: it yields no items and the current
    /// store revision.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn list(
        &self,
        namespace: Option<&str>,
        hint: Option<Revision>,
    ) -> StorageResult<(Vec<T>, Revision)> {
        let prefix = self.keys.prefix(namespace);
        let (items, revision) = self.backend.list(&prefix).await?;
        if let Some(requested) = hint.filter(|h| *h > revision) {
            return Err(Report::new(StorageError::FutureRevision {
                requested,
                current: revision,
            }));
        }
        let items = items
            .iter()
            .map(|kv| decode(&kv.value, kv.mod_revision))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok((items, revision))
    }

    /// Persists a new object, assigning its uid, creation timestamp and
    /// first revision.
    #[tracing::instrument(skip_all, fields(name = %obj.name()))]
    pub async fn create(&self, mut obj: T) -> StorageResult<T> {
        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            return Err(Report::new(StorageError::InvalidObject {
                message: "metadata.name is required".to_string(),
            }));
        }
        if meta.namespace.is_empty() {
            meta.namespace = DEFAULT_NAMESPACE.to_string();
        }
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());
        meta.resource_version.clear();

        let key = self.keys.object(&meta.namespace, &meta.name);
        let value = encode(&obj)?;

        let _guard = self.write_lock.lock().await;
        let revision = self.backend.create(&key, value).await?;
        obj.meta_mut().resource_version = revision.to_string();
        self.publish(&key, WatchEvent::Added(obj.clone()));
        debug!(%key, revision, "created");
        Ok(obj)
    }

    /// Read-modify-write of one object.
    ///
    /// `expected` is the caller's view of the object's revision; a mismatch,
    /// or a write that lands between the read and the swap, fails with
    /// `Conflict`. Nothing is retried here.
    #[tracing::instrument(skip(self, mutate), level = "debug")]
    pub async fn guaranteed_update<F>(
        &self,
        namespace: &str,
        name: &str,
        expected: Option<Revision>,
        mutate: F,
    ) -> StorageResult<T>
    where
        F: FnOnce(T) -> StorageResult<T> + Send,
    {
        let key = self.keys.object(namespace, name);
        let Some(kv) = self.backend.get(&key).await? else {
            return Err(Report::new(StorageError::NotFound { key }));
        };
        if let Some(expected) = expected.filter(|e| *e != kv.mod_revision) {
            return Err(Report::new(StorageError::Conflict {
                key,
                message: format!(
                    "the object has been modified (revision {expected} is stale, current is {})",
                    kv.mod_revision
                ),
            }));
        }

        let current: T = decode(&kv.value, kv.mod_revision)?;
        let mut updated = mutate(current.clone())?;
        ensure_identity_unchanged(current.meta(), updated.meta())?;
        updated.meta_mut().creation_timestamp = current.meta().creation_timestamp;
        updated.meta_mut().resource_version.clear();
        let value = encode(&updated)?;

        let _guard = self.write_lock.lock().await;
        let revision = self.backend.update(&key, kv.mod_revision, value).await?;
        updated.meta_mut().resource_version = revision.to_string();
        self.publish(&key, WatchEvent::Modified(updated.clone()));
        debug!(%key, revision, "updated");
        Ok(updated)
    }

    /// Removes an object, returning it stamped with the deletion revision.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn delete(&self, namespace: &str, name: &str) -> StorageResult<T> {
        let key = self.keys.object(namespace, name);

        let _guard = self.write_lock.lock().await;
        let (previous, revision) = self.backend.delete(&key).await?;
        let obj: T = decode(&previous.value, revision)?;
        self.publish(&key, WatchEvent::Deleted(obj.clone()));
        debug!(%key, revision, "deleted");
        Ok(obj)
    }

    /// Opens a watch over a namespace, or the whole node for `None`.
    ///
    /// Registration happens under the write lock, so the backlog and the
    /// live events meet without gaps or duplicates.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn watch(
        &self,
        namespace: Option<&str>,
        start: WatchStart,
    ) -> StorageResult<WatchStream<T>> {
        let prefix = self.keys.prefix(namespace);

        let _guard = self.write_lock.lock().await;
        let backlog = match start {
            WatchStart::Snapshot => {
                let (items, _) = self.backend.list(&prefix).await?;
                items
                    .iter()
                    .map(|kv| decode(&kv.value, kv.mod_revision).map(WatchEvent::Added))
                    .collect::<StorageResult<VecDeque<_>>>()?
            }
            WatchStart::After(revision) => self
                .backend
                .events_since(&prefix, revision)
                .await?
                .iter()
                .map(event_from_raw)
                .collect::<StorageResult<VecDeque<_>>>()?,
        };
        Ok(self.watchers.register(prefix, backlog))
    }

    async fn check_hint(&self, hint: Option<Revision>) -> StorageResult<()> {
        let Some(requested) = hint else {
            return Ok(());
        };
        let current = self.backend.current_revision().await?;
        if requested > current {
            return Err(Report::new(StorageError::FutureRevision { requested, current }));
        }
        Ok(())
    }

    fn publish(&self, key: &str, event: WatchEvent<T>) {
        let evicted = self.watchers.publish(key, &event);
        if let Some(counter) = self.evictions.as_ref().filter(|_| evicted > 0) {
            counter.inc_by(evicted as u64);
        }
    }
}

fn ensure_identity_unchanged(
    current: &api_types::ObjectMeta,
    updated: &api_types::ObjectMeta,
) -> StorageResult<()> {
    let immutable = [
        ("metadata.name", &current.name, &updated.name),
        ("metadata.namespace", &current.namespace, &updated.namespace),
        ("metadata.uid", &current.uid, &updated.uid),
    ];
    for (field, was, now) in immutable {
        if was != now {
            return Err(Report::new(StorageError::InvalidObject {
                message: format!("{field} is immutable ({was:?} -> {now:?})"),
            }));
        }
    }
    Ok(())
}

fn encode<T: Serialize>(obj: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(obj).change_context(StorageError::Codec)
}

fn decode<T: Resource + DeserializeOwned>(value: &[u8], revision: Revision) -> StorageResult<T> {
    let mut obj: T = serde_json::from_slice(value).change_context(StorageError::Codec)?;
    obj.meta_mut().resource_version = revision.to_string();
    Ok(obj)
}

fn event_from_raw<T: Resource + DeserializeOwned>(event: &RawEvent) -> StorageResult<WatchEvent<T>> {
    let obj = decode(&event.value, event.revision)?;
    Ok(match event.kind {
        EventKind::Created => WatchEvent::Added(obj),
        EventKind::Updated => WatchEvent::Modified(obj),
        EventKind::Deleted => WatchEvent::Deleted(obj),
    })
}
