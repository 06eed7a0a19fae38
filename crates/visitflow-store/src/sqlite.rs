use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::traits::{DeadLetterQueue, EventRecorder, KeyValueStore, TagStore};
use visitflow_core::types::{DlqEntry, LifecycleEvent, StorageScope, TimeRange};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        site_id TEXT NOT NULL,
        visitor_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        event TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_workflow
        ON events(workflow_id, timestamp);

    CREATE TABLE IF NOT EXISTS dlq (
        id TEXT PRIMARY KEY,
        action TEXT NOT NULL,
        payload TEXT NOT NULL,
        reason TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        enqueued_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS visitor_tags (
        site_id TEXT NOT NULL,
        visitor_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (site_id, visitor_id, tag)
    );

    CREATE TABLE IF NOT EXISTS kv (
        partition TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (partition, key)
    );";

/// Fixed-width UTC timestamps, so string order matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_err(e: impl std::fmt::Display) -> VisitflowError {
    VisitflowError::Database(e.to_string())
}

/// SQLite-backed event log, DLQ, tag store, and key-value store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VisitflowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    fn insert_event(conn: &Connection, event: &LifecycleEvent) -> Result<()> {
        let data = serde_json::to_string(event)?;
        conn.execute(
            "INSERT INTO events (workflow_id, run_id, site_id, visitor_id, node_id, event, timestamp, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.workflow_id,
                event.run_id.0,
                event.site_id,
                event.visitor_id,
                event.node_id,
                event.kind.as_str(),
                ts(&event.timestamp),
                data
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Number of recorded events (all workflows).
    pub fn event_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

impl EventRecorder for SqliteStore {
    fn record(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            Self::insert_event(&conn, &event)
        })
    }

    fn record_batch(&self, events: Vec<LifecycleEvent>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            for event in &events {
                Self::insert_event(&tx, event)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(events.len())
        })
    }

    fn query(&self, workflow_id: &str, range: TimeRange) -> BoxFuture<'_, Result<Vec<LifecycleEvent>>> {
        let workflow_id = workflow_id.to_string();
        let start = range.start.as_ref().map(ts);
        let end = range.end.as_ref().map(ts);

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM events
                     WHERE workflow_id = ?1
                       AND (?2 IS NULL OR timestamp >= ?2)
                       AND (?3 IS NULL OR timestamp <= ?3)
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![workflow_id, start, end], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut events = Vec::new();
            for row in rows {
                let data = row.map_err(db_err)?;
                match serde_json::from_str::<LifecycleEvent>(&data) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(error = %e, "Skipping unreadable event row"),
                }
            }
            Ok(events)
        })
    }
}

impl DeadLetterQueue for SqliteStore {
    fn push(&self, entry: DlqEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&entry.payload)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO dlq (id, action, payload, reason, attempts, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.action,
                    payload,
                    entry.reason,
                    entry.attempts,
                    ts(&entry.enqueued_at)
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DlqEntry>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, action, payload, reason, attempts, enqueued_at FROM dlq
                     ORDER BY enqueued_at DESC, rowid DESC
                     LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], read_dlq_row)
                .map_err(db_err)?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, action, payload, reason, attempts, enqueued_at) = row.map_err(db_err)?;
                entries.push(dlq_entry(id, action, &payload, reason, attempts, &enqueued_at)?);
            }
            Ok(entries)
        })
    }

    fn take(&self, id: &str) -> BoxFuture<'_, Result<Option<DlqEntry>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT id, action, payload, reason, attempts, enqueued_at FROM dlq WHERE id = ?1",
                    params![id],
                    read_dlq_row,
                )
                .optional()
                .map_err(db_err)?;
            let Some((id, action, payload, reason, attempts, enqueued_at)) = row else {
                return Ok(None);
            };
            conn.execute("DELETE FROM dlq WHERE id = ?1", params![id])
                .map_err(db_err)?;
            dlq_entry(id, action, &payload, reason, attempts, &enqueued_at).map(Some)
        })
    }
}

type DlqRow = (String, String, String, String, u32, String);

fn read_dlq_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DlqRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn dlq_entry(
    id: String,
    action: String,
    payload: &str,
    reason: String,
    attempts: u32,
    enqueued_at: &str,
) -> Result<DlqEntry> {
    let enqueued_at = DateTime::parse_from_rfc3339(enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(DlqEntry {
        id,
        action,
        payload: serde_json::from_str(payload)?,
        reason,
        attempts,
        enqueued_at,
    })
}

impl TagStore for SqliteStore {
    fn has_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<bool>> {
        let (site_id, visitor_id, tag) = (site_id.to_string(), visitor_id.to_string(), tag.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            let found = conn
                .query_row(
                    "SELECT 1 FROM visitor_tags WHERE site_id = ?1 AND visitor_id = ?2 AND tag = ?3",
                    params![site_id, visitor_id, tag],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?;
            Ok(found.is_some())
        })
    }

    fn add_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>> {
        let (site_id, visitor_id, tag) = (site_id.to_string(), visitor_id.to_string(), tag.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO visitor_tags (site_id, visitor_id, tag, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![site_id, visitor_id, tag, ts(&Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn remove_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>> {
        let (site_id, visitor_id, tag) = (site_id.to_string(), visitor_id.to_string(), tag.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM visitor_tags WHERE site_id = ?1 AND visitor_id = ?2 AND tag = ?3",
                params![site_id, visitor_id, tag],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn tags(&self, site_id: &str, visitor_id: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let (site_id, visitor_id) = (site_id.to_string(), visitor_id.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT tag FROM visitor_tags WHERE site_id = ?1 AND visitor_id = ?2
                     ORDER BY created_at, tag",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![site_id, visitor_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let (partition, key) = (scope.partition(), key.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT value FROM kv WHERE partition = ?1 AND key = ?2",
                params![partition, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn set(&self, scope: &StorageScope, key: &str, value: &str) -> BoxFuture<'_, Result<()>> {
        let (partition, key, value) = (scope.partition(), key.to_string(), value.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO kv (partition, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(partition, key) DO UPDATE SET value = excluded.value",
                params![partition, key, value],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn remove(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<()>> {
        let (partition, key) = (scope.partition(), key.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
                params![partition, key],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn clear(&self, scope: &StorageScope) -> BoxFuture<'_, Result<()>> {
        let partition = scope.partition();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute("DELETE FROM kv WHERE partition = ?1", params![partition])
                .map_err(db_err)?;
            Ok(())
        })
    }
}
