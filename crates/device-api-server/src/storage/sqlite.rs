//! SQLite-backed revision log.
//!
//! Every write appends a row to `kv_log`; the row id doubles as the store
//! revision. The newest row for a key is its current value unless that row
//! records a deletion.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::Transaction;
use tracing::info;

use super::Backend;
use super::EventKind;
use super::KeyValue;
use super::RawEvent;
use super::Revision;
use super::StorageError;
use super::StorageResult;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv_log (\
        revision INTEGER PRIMARY KEY AUTOINCREMENT, \
        key TEXT NOT NULL, \
        created INTEGER NOT NULL, \
        deleted INTEGER NOT NULL, \
        create_revision INTEGER NOT NULL, \
        value BLOB NOT NULL)",
    "CREATE INDEX IF NOT EXISTS kv_log_key_revision ON kv_log (key, revision)",
    "CREATE TABLE IF NOT EXISTS kv_meta (name TEXT PRIMARY KEY, value INTEGER NOT NULL)",
    "INSERT OR IGNORE INTO kv_meta (name, value) VALUES ('compacted_revision', 0)",
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent backend storing the revision log in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

/// Latest log row for a key, live or deleted.
struct Head {
    revision: Revision,
    create_revision: Revision,
    deleted: bool,
    value: Vec<u8>,
}

fn backend_error() -> StorageError {
    StorageError::Backend
}

impl SqliteBackend {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context_lazy(backend_error)
                .attach_printable_lazy(|| format!("creating {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let backend = Self::connect(options).await?;
        info!(path = %path.display(), "opened SQLite storage");
        Ok(backend)
    }

    /// A private, non-persistent database.
    pub async fn open_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .change_context_lazy(backend_error)?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> StorageResult<Self> {
        // A single connection serialises access and keeps in-memory databases
        // alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .change_context_lazy(backend_error)
            .attach_printable("failed to connect to SQLite")?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .change_context_lazy(backend_error)
                .attach_printable("failed to apply schema")?;
        }
        Ok(Self { pool })
    }

    async fn begin(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.change_context_lazy(backend_error)
    }

    async fn head(tx: &mut Transaction<'static, Sqlite>, key: &str) -> StorageResult<Option<Head>> {
        let row = sqlx::query(
            "SELECT revision, create_revision, deleted, value FROM kv_log \
             WHERE key = ? ORDER BY revision DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .change_context_lazy(backend_error)?;

        row.map(|row| {
            Ok::<_, sqlx::Error>(Head {
                revision: row.try_get("revision")?,
                create_revision: row.try_get("create_revision")?,
                deleted: row.try_get::<i64, _>("deleted")? != 0,
                value: row.try_get("value")?,
            })
        })
        .transpose()
        .change_context_lazy(backend_error)
    }

    async fn append(
        tx: &mut Transaction<'static, Sqlite>,
        key: &str,
        kind: EventKind,
        create_revision: Option<Revision>,
        value: &[u8],
    ) -> StorageResult<Revision> {
        let result = sqlx::query(
            "INSERT INTO kv_log (key, created, deleted, create_revision, value) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(i64::from(kind == EventKind::Created))
        .bind(i64::from(kind == EventKind::Deleted))
        .bind(create_revision.unwrap_or(0))
        .bind(value)
        .execute(&mut **tx)
        .await
        .change_context_lazy(backend_error)?;
        let revision = result.last_insert_rowid();

        if create_revision.is_none() {
            sqlx::query("UPDATE kv_log SET create_revision = ? WHERE revision = ?")
                .bind(revision)
                .bind(revision)
                .execute(&mut **tx)
                .await
                .change_context_lazy(backend_error)?;
        }
        Ok(revision)
    }

    async fn revision_in(tx: &mut Transaction<'static, Sqlite>) -> StorageResult<Revision> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'kv_log'), 0)",
        )
        .fetch_one(&mut **tx)
        .await
        .change_context_lazy(backend_error)
    }

    async fn compacted_in(tx: &mut Transaction<'static, Sqlite>) -> StorageResult<Revision> {
        sqlx::query_scalar::<_, i64>("SELECT value FROM kv_meta WHERE name = 'compacted_revision'")
            .fetch_one(&mut **tx)
            .await
            .change_context_lazy(backend_error)
    }

    async fn commit(tx: Transaction<'static, Sqlite>) -> StorageResult<()> {
        tx.commit().await.change_context_lazy(backend_error)
    }
}

fn key_value_from_row(row: &SqliteRow) -> Result<KeyValue, sqlx::Error> {
    Ok(KeyValue {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        create_revision: row.try_get("create_revision")?,
        mod_revision: row.try_get("revision")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<RawEvent, sqlx::Error> {
    let kind = if row.try_get::<i64, _>("deleted")? != 0 {
        EventKind::Deleted
    } else if row.try_get::<i64, _>("created")? != 0 {
        EventKind::Created
    } else {
        EventKind::Updated
    };
    Ok(RawEvent {
        kind,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        revision: row.try_get("revision")?,
    })
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn current_revision(&self) -> StorageResult<Revision> {
        let mut tx = self.begin().await?;
        let revision = Self::revision_in(&mut tx).await?;
        Self::commit(tx).await?;
        Ok(revision)
    }

    async fn compacted_revision(&self) -> StorageResult<Revision> {
        let mut tx = self.begin().await?;
        let revision = Self::compacted_in(&mut tx).await?;
        Self::commit(tx).await?;
        Ok(revision)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        let mut tx = self.begin().await?;
        let head = Self::head(&mut tx, key).await?;
        Self::commit(tx).await?;
        Ok(head.filter(|h| !h.deleted).map(|h| KeyValue {
            key: key.to_string(),
            value: h.value,
            create_revision: h.create_revision,
            mod_revision: h.revision,
        }))
    }

    async fn list(&self, prefix: &str) -> StorageResult<(Vec<KeyValue>, Revision)> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT l.key, l.value, l.create_revision, l.revision FROM kv_log AS l \
             JOIN (SELECT key, MAX(revision) AS revision FROM kv_log \
                   WHERE substr(key, 1, length(?)) = ? GROUP BY key) AS latest \
               ON l.key = latest.key AND l.revision = latest.revision \
             WHERE l.deleted = 0 ORDER BY l.key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await
        .change_context_lazy(backend_error)?;
        let revision = Self::revision_in(&mut tx).await?;
        Self::commit(tx).await?;

        let items = rows
            .iter()
            .map(key_value_from_row)
            .collect::<Result<Vec<_>, _>>()
            .change_context_lazy(backend_error)?;
        Ok((items, revision))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<Revision> {
        let mut tx = self.begin().await?;
        if Self::head(&mut tx, key).await?.is_some_and(|h| !h.deleted) {
            return Err(Report::new(StorageError::AlreadyExists {
                key: key.to_string(),
            }));
        }
        let revision = Self::append(&mut tx, key, EventKind::Created, None, &value).await?;
        Self::commit(tx).await?;
        Ok(revision)
    }

    async fn update(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
    ) -> StorageResult<Revision> {
        let mut tx = self.begin().await?;
        let head = match Self::head(&mut tx, key).await? {
            Some(head) if !head.deleted => head,
            _ => {
                return Err(Report::new(StorageError::NotFound {
                    key: key.to_string(),
                }))
            }
        };
        if head.revision != expected {
            return Err(Report::new(StorageError::Conflict {
                key: key.to_string(),
                message: format!("expected revision {expected}, found {}", head.revision),
            }));
        }
        let revision = Self::append(
            &mut tx,
            key,
            EventKind::Updated,
            Some(head.create_revision),
            &value,
        )
        .await?;
        Self::commit(tx).await?;
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StorageResult<(KeyValue, Revision)> {
        let mut tx = self.begin().await?;
        let head = match Self::head(&mut tx, key).await? {
            Some(head) if !head.deleted => head,
            _ => {
                return Err(Report::new(StorageError::NotFound {
                    key: key.to_string(),
                }))
            }
        };
        let revision = Self::append(
            &mut tx,
            key,
            EventKind::Deleted,
            Some(head.create_revision),
            &head.value,
        )
        .await?;
        Self::commit(tx).await?;
        Ok((
            KeyValue {
                key: key.to_string(),
                value: head.value,
                create_revision: head.create_revision,
                mod_revision: head.revision,
            },
            revision,
        ))
    }

    async fn events_since(&self, prefix: &str, after: Revision) -> StorageResult<Vec<RawEvent>> {
        let mut tx = self.begin().await?;
        let compacted = Self::compacted_in(&mut tx).await?;
        if after < compacted {
            return Err(Report::new(StorageError::Expired {
                requested: after,
                compacted,
            }));
        }
        let rows = sqlx::query(
            "SELECT revision, key, created, deleted, value FROM kv_log \
             WHERE revision > ? AND substr(key, 1, length(?)) = ? ORDER BY revision",
        )
        .bind(after)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await
        .change_context_lazy(backend_error)?;
        Self::commit(tx).await?;

        rows.iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .change_context_lazy(backend_error)
    }

    async fn compact(&self, revision: Revision) -> StorageResult<Revision> {
        let mut tx = self.begin().await?;
        let current = Self::revision_in(&mut tx).await?;
        let compacted = Self::compacted_in(&mut tx).await?;
        let target = revision.min(current);
        if target <= compacted {
            Self::commit(tx).await?;
            return Ok(compacted);
        }

        let removed = sqlx::query(
            "DELETE FROM kv_log WHERE revision <= ? AND (deleted = 1 OR revision < \
             (SELECT MAX(newer.revision) FROM kv_log AS newer WHERE newer.key = kv_log.key))",
        )
        .bind(target)
        .execute(&mut *tx)
        .await
        .change_context_lazy(backend_error)?
        .rows_affected();

        sqlx::query("UPDATE kv_meta SET value = ? WHERE name = 'compacted_revision'")
            .bind(target)
            .execute(&mut *tx)
            .await
            .change_context_lazy(backend_error)?;
        Self::commit(tx).await?;

        tracing::debug!(revision = target, removed, "compacted SQLite history");
        Ok(target)
    }
}
