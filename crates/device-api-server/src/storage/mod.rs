//! Revisioned key/value storage for API objects.
//!
//! [`Backend`] implementations own the raw log of revisions; [`Store`] layers
//! typed objects, identity assignment and watch fan-out on top of them.

mod backend;
mod compactor;
mod keys;
mod memory;
mod sqlite;
mod store;
mod watch;

use core::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;

pub use backend::Backend;
pub use backend::EventKind;
pub use backend::KeyValue;
pub use backend::RawEvent;
pub use compactor::Compactor;
pub use compactor::RETAINED_REVISIONS;
pub use keys::KeyBuilder;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use store::Store;
pub use watch::WatchEvent;
pub use watch::WatchStart;
pub use watch::WatchStream;

/// Store-wide revision counter. Zero means "nothing written yet".
pub type Revision = i64;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, Report<StorageError>>;

/// Failures surfaced by the storage layer.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[display("key {key} not found")]
    NotFound { key: String },

    #[display("key {key} already exists")]
    AlreadyExists { key: String },

    #[display("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    #[display("invalid object: {message}")]
    InvalidObject { message: String },

    #[display("revision {requested} has been compacted, oldest available is {compacted}")]
    Expired {
        requested: Revision,
        compacted: Revision,
    },

    #[display("revision {requested} is newer than the current revision {current}")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },

    #[display("watcher fell behind and was evicted")]
    WatcherEvicted,

    #[display("failed to encode or decode a stored object")]
    Codec,

    #[display("storage backend failure")]
    Backend,
}

impl Error for StorageError {}

/// Parses a client supplied resource version.
///
/// Empty means "no hint".
pub fn parse_revision(resource_version: &str) -> StorageResult<Option<Revision>> {
    if resource_version.is_empty() {
        return Ok(None);
    }
    let revision = resource_version
        .parse::<Revision>()
        .change_context_lazy(|| StorageError::InvalidObject {
            message: format!("resource version {resource_version:?} is not a revision"),
        })?;
    if revision < 0 {
        return Err(Report::new(StorageError::InvalidObject {
            message: format!("resource version {resource_version:?} is negative"),
        }));
    }
    Ok(Some(revision))
}

/// Knobs for opening a backend and running its compactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// SQLite database file; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// `None` disables compaction.
    pub compaction_interval: Option<Duration>,
    pub compaction_batch_size: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            compaction_interval: Some(Duration::from_secs(300)),
            compaction_batch_size: 1000,
        }
    }
}

/// Opens the backend selected by `config`.
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn Backend>> {
    match &config.database_path {
        Some(path) => {
            let backend = SqliteBackend::open(path)
                .await
                .attach_printable_lazy(|| format!("database path: {}", path.display()))?;
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(MemoryBackend::new())),
    }
}
