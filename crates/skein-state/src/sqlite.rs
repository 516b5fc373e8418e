use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::types::ThreadId;

use crate::backend::SnapshotStore;
use crate::snapshot::ExecutionSnapshot;

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;

     CREATE TABLE IF NOT EXISTS snapshots (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         thread_id TEXT NOT NULL,
         step INTEGER NOT NULL,
         version INTEGER NOT NULL,
         cursor TEXT,
         fields_json TEXT NOT NULL,
         created_at TEXT NOT NULL,
         UNIQUE(thread_id, version)
     );

     CREATE INDEX IF NOT EXISTS idx_snapshots_thread
         ON snapshots(thread_id, version DESC);";

/// Embedded single-process snapshot store backed by SQLite.
///
/// Also serves as the degraded fallback when the shared store is unreachable.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SkeinError::Unavailable(format!("Failed to create state directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| SkeinError::Unavailable(format!("Failed to open state store: {}", e)))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| SkeinError::Unavailable(format!("Failed to initialize schema: {}", e)))?;

        debug!(path = %path.display(), "Embedded state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SkeinError::Unavailable(format!("Failed to open state store: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SkeinError::Unavailable(format!("Failed to initialize schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        let fields_json = ExecutionSnapshot::serialize_fields(&snapshot.fields)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkeinError::Database(e.to_string()))?;

        let inserted = conn.execute(
            "INSERT INTO snapshots (thread_id, step, version, cursor, fields_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.thread_id.as_str(),
                snapshot.step as i64,
                snapshot.version as i64,
                snapshot.cursor,
                fields_json,
                snapshot.created_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SkeinError::Conflict {
                    thread_id: snapshot.thread_id.to_string(),
                    version: snapshot.version,
                })
            }
            Err(e) => Err(SkeinError::Database(format!(
                "Failed to save snapshot: {}",
                e
            ))),
        }
    }

    fn query_latest(&self, thread_id: &ThreadId) -> Result<Option<ExecutionSnapshot>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkeinError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT thread_id, step, version, cursor, fields_json, created_at
                 FROM snapshots
                 WHERE thread_id = ?1
                 ORDER BY version DESC
                 LIMIT 1",
            )
            .map_err(|e| SkeinError::Database(e.to_string()))?;

        stmt.query_row(params![thread_id.as_str()], |row| {
            let ts_str: String = row.get(5)?;
            Ok(ExecutionSnapshot {
                thread_id: ThreadId::from_str(&row.get::<_, String>(0)?),
                step: row.get::<_, i64>(1)? as u64,
                version: row.get::<_, i64>(2)? as u64,
                cursor: row.get(3)?,
                fields: ExecutionSnapshot::deserialize_fields(&row.get::<_, String>(4)?)
                    .unwrap_or_default(),
                created_at: DateTime::parse_from_rfc3339(&ts_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .optional()
        .map_err(|e| SkeinError::Database(e.to_string()))
    }
}

impl SnapshotStore for SqliteStateStore {
    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| SkeinError::Database(e.to_string()))?;
            conn.query_row("SELECT COUNT(*) FROM snapshots", [], |_| Ok(()))
                .map_err(|e| SkeinError::Database(e.to_string()))
        })
    }

    fn put(&self, snapshot: &ExecutionSnapshot) -> BoxFuture<'_, Result<()>> {
        let snapshot = snapshot.clone();
        Box::pin(async move { self.insert(&snapshot) })
    }

    fn latest(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<ExecutionSnapshot>>> {
        let thread_id = thread_id.clone();
        Box::pin(async move { self.query_latest(&thread_id) })
    }
}
