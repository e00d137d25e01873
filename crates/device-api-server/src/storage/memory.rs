use std::collections::BTreeMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::RwLock;

use super::Backend;
use super::EventKind;
use super::KeyValue;
use super::RawEvent;
use super::Revision;
use super::StorageError;
use super::StorageResult;

#[derive(Debug, Default)]
struct Inner {
    revision: Revision,
    compacted: Revision,
    live: BTreeMap<String, KeyValue>,
    log: VecDeque<RawEvent>,
}

impl Inner {
    fn append(&mut self, kind: EventKind, key: &str, value: Vec<u8>) -> Revision {
        self.revision += 1;
        self.log.push_back(RawEvent {
            kind,
            key: key.to_string(),
            value,
            revision: self.revision,
        });
        self.revision
    }
}

/// Process-local backend. History lives until compacted; nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn current_revision(&self) -> StorageResult<Revision> {
        Ok(self.inner.read().await.revision)
    }

    async fn compacted_revision(&self) -> StorageResult<Revision> {
        Ok(self.inner.read().await.compacted)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        Ok(self.inner.read().await.live.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StorageResult<(Vec<KeyValue>, Revision)> {
        let inner = self.inner.read().await;
        let items = inner
            .live
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok((items, inner.revision))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<Revision> {
        let mut inner = self.inner.write().await;
        if inner.live.contains_key(key) {
            return Err(Report::new(StorageError::AlreadyExists {
                key: key.to_string(),
            }));
        }
        let revision = inner.append(EventKind::Created, key, value.clone());
        inner.live.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value,
                create_revision: revision,
                mod_revision: revision,
            },
        );
        Ok(revision)
    }

    async fn update(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
    ) -> StorageResult<Revision> {
        let mut inner = self.inner.write().await;
        let current = match inner.live.get(key) {
            Some(kv) => kv.mod_revision,
            None => {
                return Err(Report::new(StorageError::NotFound {
                    key: key.to_string(),
                }))
            }
        };
        if current != expected {
            return Err(Report::new(StorageError::Conflict {
                key: key.to_string(),
                message: format!("expected revision {expected}, found {current}"),
            }));
        }
        let revision = inner.append(EventKind::Updated, key, value.clone());
        if let Some(kv) = inner.live.get_mut(key) {
            kv.value = value;
            kv.mod_revision = revision;
        }
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StorageResult<(KeyValue, Revision)> {
        let mut inner = self.inner.write().await;
        let Some(previous) = inner.live.remove(key) else {
            return Err(Report::new(StorageError::NotFound {
                key: key.to_string(),
            }));
        };
        let revision = inner.append(EventKind::Deleted, key, previous.value.clone());
        Ok((previous, revision))
    }

    async fn events_since(&self, prefix: &str, after: Revision) -> StorageResult<Vec<RawEvent>> {
        let inner = self.inner.read().await;
        if after < inner.compacted {
            return Err(Report::new(StorageError::Expired {
                requested: after,
                compacted: inner.compacted,
            }));
        }
        Ok(inner
            .log
            .iter()
            .filter(|e| e.revision > after && e.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn compact(&self, revision: Revision) -> StorageResult<Revision> {
        let mut inner = self.inner.write().await;
        let target = revision.min(inner.revision);
        if target <= inner.compacted {
            return Ok(inner.compacted);
        }
        while inner.log.front().is_some_and(|e| e.revision <= target) {
            inner.log.pop_front();
        }
        inner.compacted = target;
        Ok(target)
    }
}
