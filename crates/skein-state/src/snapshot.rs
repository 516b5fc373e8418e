use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skein_core::error::{Result, SkeinError};
use skein_core::types::ThreadId;

/// One persisted, versioned copy of full execution state at a step boundary.
///
/// Snapshots are insert-only: the next step supersedes the previous snapshot,
/// it never overwrites it. `version` is contiguous from 1 per thread and
/// doubles as the optimistic concurrency marker — a writer holding stale state
/// produces a version that already exists and is rejected with a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub thread_id: ThreadId,
    /// Step counter, one per completed node.
    pub step: u64,
    /// Optimistic concurrency marker.
    pub version: u64,
    /// Next node to execute when resuming; `None` once the run completed.
    pub cursor: Option<String>,
    /// Full current value of every state field, including the namespaced
    /// `{role}_output` / `{role}_session` / `{role}_cost` agent fields.
    pub fields: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    /// The snapshot that succeeds this one after a node wrote `fields`.
    pub fn next(&self, cursor: Option<String>, fields: HashMap<String, serde_json::Value>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            step: self.step + 1,
            version: self.version + 1,
            cursor,
            fields,
            created_at: Utc::now(),
        }
    }

    /// First snapshot of a fresh thread.
    pub fn first(
        thread_id: ThreadId,
        cursor: Option<String>,
        fields: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            thread_id,
            step: 1,
            version: 1,
            cursor,
            fields,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.is_none()
    }

    /// Serialize the field map for storage.
    pub fn serialize_fields(fields: &HashMap<String, serde_json::Value>) -> Result<String> {
        serde_json::to_string(fields)
            .map_err(|e| SkeinError::Database(format!("Failed to serialize state fields: {}", e)))
    }

    /// Deserialize a stored field map.
    pub fn deserialize_fields(json: &str) -> Result<HashMap<String, serde_json::Value>> {
        serde_json::from_str(json)
            .map_err(|e| SkeinError::Database(format!("Failed to deserialize state fields: {}", e)))
    }
}
