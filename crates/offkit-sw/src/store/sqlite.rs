//! SQLite persistence for partitions and the outbound sync queue.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use chrono::Utc;
use offkit_common::Timestamp;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CacheBackend, CacheEntry};
use crate::error::StoreError;
use crate::sync::{QueueStore, QueuedOperation};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed store. One file holds every partition of every version
/// plus the sync queue, so both survive restarts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened offline store");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )?;

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS partitions (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            partition TEXT NOT NULL REFERENCES partitions(name) ON DELETE CASCADE,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            payload BLOB NOT NULL,
            captured_at INTEGER NOT NULL,
            PRIMARY KEY (partition, url)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_captured ON cache_entries(partition, captured_at);

        CREATE TABLE IF NOT EXISTS sync_queue (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            lane TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_queue_lane ON sync_queue(lane, sequence);
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    debug!(version = SCHEMA_VERSION, "Created offline store schema");
    Ok(())
}

fn to_sql_ts(ts: Timestamp) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn from_sql_ts(ts: i64) -> Timestamp {
    u64::try_from(ts).unwrap_or_default()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(CacheEntry, String)> {
    let headers: String = row.get("headers")?;
    let payload: Vec<u8> = row.get("payload")?;
    Ok((
        CacheEntry {
            url: row.get("url")?,
            method: row.get("method")?,
            status: row.get("status")?,
            headers: HashMap::new(),
            payload: Bytes::from(payload),
            captured_at: from_sql_ts(row.get("captured_at")?),
        },
        headers,
    ))
}

fn with_headers(
    (mut entry, headers): (CacheEntry, String),
) -> Result<CacheEntry, StoreError> {
    entry.headers = serde_json::from_str(&headers)?;
    Ok(entry)
}

fn partition_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM partitions WHERE name = ?1", [name], |_| Ok(()))
        .optional()?
        .is_some())
}

fn require_partition(conn: &Connection, name: &str) -> Result<(), StoreError> {
    if partition_exists(conn, name)? {
        Ok(())
    } else {
        Err(StoreError::UnknownPartition(name.to_string()))
    }
}

fn upsert_entry(conn: &Connection, partition: &str, entry: &CacheEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries
            (partition, url, method, status, headers, payload, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            partition,
            entry.url,
            entry.method,
            entry.status,
            serde_json::to_string(&entry.headers)?,
            &entry.payload[..],
            to_sql_ts(entry.captured_at),
        ],
    )?;
    Ok(())
}

impl CacheBackend for SqliteStore {
    fn open_partition(&self, name: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn has_partition(&self, name: &str) -> Result<bool, StoreError> {
        partition_exists(&self.conn.lock(), name)
    }

    fn partition_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn delete_partition(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM partitions WHERE name = ?1", [name])?;
        Ok(removed > 0)
    }

    fn get(&self, partition: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT url, method, status, headers, payload, captured_at
                 FROM cache_entries WHERE partition = ?1 AND url = ?2",
                params![partition, url],
                entry_from_row,
            )
            .optional()?;
        row.map(with_headers).transpose()
    }

    fn put(
        &self,
        partition: &str,
        entry: CacheEntry,
        max_entries: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_partition(&tx, partition)?;
        upsert_entry(&tx, partition, &entry)?;

        let mut evicted = Vec::new();
        if let Some(max) = max_entries {
            {
                let mut stmt = tx.prepare(
                    "SELECT url FROM cache_entries WHERE partition = ?1
                     ORDER BY captured_at DESC, url DESC LIMIT -1 OFFSET ?2",
                )?;
                evicted = stmt
                    .query_map(params![partition, max as i64], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
            }
            for url in &evicted {
                tx.execute(
                    "DELETE FROM cache_entries WHERE partition = ?1 AND url = ?2",
                    params![partition, url],
                )?;
            }
        }

        tx.commit()?;
        if !evicted.is_empty() {
            debug!(partition, evicted = evicted.len(), "Evicted oldest entries");
        }
        Ok(evicted)
    }

    fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_partition(&tx, partition)?;
        for entry in &entries {
            upsert_entry(&tx, partition, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, partition: &str, url: &str) -> Result<bool, StoreError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE partition = ?1 AND url = ?2",
            params![partition, url],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT url FROM cache_entries WHERE partition = ?1")?;
        let keys = stmt
            .query_map([partition], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    fn clear(&self, partition: &str) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE partition = ?1", [partition])?)
    }

    fn prune_before(&self, partition: &str, cutoff: Timestamp) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE partition = ?1 AND captured_at < ?2",
            params![partition, to_sql_ts(cutoff)],
        )?)
    }
}

fn op_from_row(row: &Row<'_>) -> rusqlite::Result<(QueuedOperation, String, String)> {
    let id: String = row.get("id")?;
    let headers: String = row.get("headers")?;
    let body: Vec<u8> = row.get("body")?;
    Ok((
        QueuedOperation {
            id: Uuid::nil(),
            lane: row.get("lane")?,
            sequence: from_sql_ts(row.get("sequence")?),
            created_at: from_sql_ts(row.get("created_at")?),
            endpoint: row.get("endpoint")?,
            method: row.get("method")?,
            headers: HashMap::new(),
            body: Bytes::from(body),
            attempts: row.get("attempts")?,
            next_attempt_at: from_sql_ts(row.get("next_attempt_at")?),
        },
        id,
        headers,
    ))
}

fn finish_op(
    (mut op, id, headers): (QueuedOperation, String, String),
) -> Result<QueuedOperation, StoreError> {
    op.id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("queue id {id}: {e}")))?;
    op.headers = serde_json::from_str(&headers)?;
    Ok(op)
}

const OP_COLUMNS: &str =
    "sequence, id, lane, created_at, endpoint, method, headers, body, attempts, next_attempt_at";

impl QueueStore for SqliteStore {
    fn append(&self, mut op: QueuedOperation) -> Result<QueuedOperation, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_queue
                (id, lane, created_at, endpoint, method, headers, body, attempts, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.id.to_string(),
                op.lane,
                to_sql_ts(op.created_at),
                op.endpoint,
                op.method,
                serde_json::to_string(&op.headers)?,
                &op.body[..],
                op.attempts,
                to_sql_ts(op.next_attempt_at),
            ],
        )?;
        op.sequence = from_sql_ts(conn.last_insert_rowid());
        Ok(op)
    }

    fn lanes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT lane FROM sync_queue ORDER BY lane")?;
        let lanes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(lanes)
    }

    fn head(&self, lane: &str) -> Result<Option<QueuedOperation>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {OP_COLUMNS} FROM sync_queue WHERE lane = ?1 ORDER BY sequence LIMIT 1"
                ),
                [lane],
                op_from_row,
            )
            .optional()?;
        row.map(finish_op).transpose()
    }

    fn pending(&self, lane: &str) -> Result<Vec<QueuedOperation>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OP_COLUMNS} FROM sync_queue WHERE lane = ?1 ORDER BY sequence"
        ))?;
        let rows = stmt
            .query_map([lane], op_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(finish_op).collect()
    }

    fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM sync_queue WHERE id = ?1", [id.to_string()])?;
        Ok(removed > 0)
    }

    fn record_failure(&self, id: Uuid, next_attempt_at: Timestamp) -> Result<u32, StoreError> {
        let conn = self.conn.lock();
        let attempts = conn
            .query_row(
                "UPDATE sync_queue SET attempts = attempts + 1, next_attempt_at = ?2
                 WHERE id = ?1 RETURNING attempts",
                params![id.to_string(), to_sql_ts(next_attempt_at)],
                |row| row.get(0),
            )
            .optional()?;
        attempts.ok_or_else(|| StoreError::Corrupt(format!("queued operation {id} vanished")))
    }

    fn reset_backoff(&self) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(
            "UPDATE sync_queue SET next_attempt_at = 0 WHERE next_attempt_at != 0",
            [],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{entry, exercise_backend};
    use crate::sync::testing::{exercise_queue_store, op};

    #[test]
    fn test_sqlite_backend_contract() {
        exercise_backend(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_queue_contract() {
        exercise_queue_store(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offkit.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.open_partition("precache-v3").unwrap();
            store
                .put("precache-v3", entry("https://shop.test/", "<html>", 42), None)
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let got = store.get("precache-v3", "https://shop.test/").unwrap().unwrap();
        assert_eq!(&got.payload[..], b"<html>");
        assert_eq!(got.captured_at, 42);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offkit.db");

        let queued = {
            let store = SqliteStore::open(&path).unwrap();
            store.append(op("cart", "https://shop.test/api/cart", "{\"qty\":2}", 7)).unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let head = store.head("cart").unwrap().unwrap();
        assert_eq!(head, queued);
    }

    #[test]
    fn test_deleting_partition_cascades_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.open_partition("api-v1").unwrap();
        store.put("api-v1", entry("https://shop.test/api/x", "x", 1), None).unwrap();
        store.delete_partition("api-v1").unwrap();
        store.open_partition("api-v1").unwrap();
        assert!(store.keys("api-v1").unwrap().is_empty());
    }
}
