use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::types::ThreadId;

use crate::backend::SnapshotStore;
use crate::snapshot::ExecutionSnapshot;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id BIGSERIAL PRIMARY KEY,
    thread_id TEXT NOT NULL,
    step BIGINT NOT NULL,
    version BIGINT NOT NULL,
    cursor TEXT,
    fields JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (thread_id, version)
)
"#;

/// Shared snapshot store backed by Postgres.
///
/// Multiple runtime processes may write concurrently; the
/// `UNIQUE (thread_id, version)` constraint is the optimistic check that turns
/// a stale writer into a conflict instead of a silent overwrite.
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| SkeinError::Database(format!("Postgres connect failed: {}", e)))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| SkeinError::Database(format!("Schema bootstrap failed: {}", e)))?;

        debug!("Shared state store connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SnapshotStore for PgStateStore {
    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Schema presence check, not just a live socket.
            sqlx::query("SELECT 1 FROM snapshots LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SkeinError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn put(&self, snapshot: &ExecutionSnapshot) -> BoxFuture<'_, Result<()>> {
        let snapshot = snapshot.clone();
        Box::pin(async move {
            let fields = serde_json::to_value(&snapshot.fields)?;
            sqlx::query(
                r#"
                INSERT INTO snapshots (thread_id, step, version, cursor, fields, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(snapshot.thread_id.as_str())
            .bind(snapshot.step as i64)
            .bind(snapshot.version as i64)
            .bind(&snapshot.cursor)
            .bind(fields)
            .bind(snapshot.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => SkeinError::Conflict {
                    thread_id: snapshot.thread_id.to_string(),
                    version: snapshot.version,
                },
                _ => SkeinError::Database(format!("Failed to save snapshot: {}", e)),
            })?;
            Ok(())
        })
    }

    fn latest(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<ExecutionSnapshot>>> {
        let thread_id = thread_id.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT thread_id, step, version, cursor, fields, created_at
                FROM snapshots
                WHERE thread_id = $1
                ORDER BY version DESC
                LIMIT 1
                "#,
            )
            .bind(thread_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SkeinError::Database(e.to_string()))?;

            match row {
                Some(r) => {
                    let fields_value: serde_json::Value = r
                        .try_get("fields")
                        .map_err(|e| SkeinError::Database(e.to_string()))?;
                    let fields: HashMap<String, serde_json::Value> =
                        serde_json::from_value(fields_value)?;
                    let created_at: DateTime<Utc> = r
                        .try_get("created_at")
                        .map_err(|e| SkeinError::Database(e.to_string()))?;

                    Ok(Some(ExecutionSnapshot {
                        thread_id: ThreadId::from_str(
                            r.try_get::<String, _>("thread_id")
                                .map_err(|e| SkeinError::Database(e.to_string()))?
                                .as_str(),
                        ),
                        step: r
                            .try_get::<i64, _>("step")
                            .map_err(|e| SkeinError::Database(e.to_string()))?
                            as u64,
                        version: r
                            .try_get::<i64, _>("version")
                            .map_err(|e| SkeinError::Database(e.to_string()))?
                            as u64,
                        cursor: r
                            .try_get("cursor")
                            .map_err(|e| SkeinError::Database(e.to_string()))?,
                        fields,
                        created_at,
                    }))
                }
                None => Ok(None),
            }
        })
    }
}
