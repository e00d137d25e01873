use async_trait::async_trait;

use super::Revision;
use super::StorageResult;

/// Latest value of a live key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// One entry of the revision log.
///
/// For deletions `value` holds the last value the key had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// A transactional, revisioned key/value log.
///
/// Every successful write allocates the next revision from a single counter
/// shared by all keys. Callers serialise writes that must be observed in
/// order; backends only guarantee atomicity of each call.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Revision of the most recent write, zero for an empty store.
    async fn current_revision(&self) -> StorageResult<Revision>;

    /// Events at or below this revision are no longer available.
    async fn compacted_revision(&self) -> StorageResult<Revision>;

    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>>;

    /// Live keys under `prefix`, ordered by key, plus the revision the
    /// snapshot was taken at.
    async fn list(&self, prefix: &str) -> StorageResult<(Vec<KeyValue>, Revision)>;

    /// Fails with `AlreadyExists` when the key is live.
    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<Revision>;

    /// Compare-and-swap on the key's mod revision.
    ///
    /// Fails with `NotFound` when the key is absent and `Conflict` when its
    /// mod revision differs from `expected`.
    async fn update(&self, key: &str, expected: Revision, value: Vec<u8>)
        -> StorageResult<Revision>;

    /// Removes the key, returning its last value and the deletion revision.
    async fn delete(&self, key: &str) -> StorageResult<(KeyValue, Revision)>;

    /// Log entries under `prefix` strictly after `after`, in revision order.
    ///
    /// Fails with `Expired` when `after` predates the compacted revision.
    async fn events_since(&self, prefix: &str, after: Revision) -> StorageResult<Vec<RawEvent>>;

    /// Discards history at or below `revision`, keeping live values.
    async fn compact(&self, revision: Revision) -> StorageResult<Revision>;
}
