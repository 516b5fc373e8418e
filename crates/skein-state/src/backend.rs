use std::sync::Arc;

use futures::future::BoxFuture;

use skein_core::error::Result;
use skein_core::types::{BackendMode, ThreadId};

use crate::snapshot::ExecutionSnapshot;

/// Durable, key-ordered store for execution snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Trivial round-trip proving the store is actually usable (schema
    /// present), not merely that a socket opened.
    fn ping(&self) -> BoxFuture<'_, Result<()>>;

    /// Persist one snapshot, all-or-nothing.
    ///
    /// Fails with `SkeinError::Conflict` when the snapshot's version already
    /// exists for its thread — the writer raced a newer execution and must
    /// not overwrite it.
    fn put(&self, snapshot: &ExecutionSnapshot) -> BoxFuture<'_, Result<()>>;

    /// Highest-version snapshot for a thread, if any.
    fn latest(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<ExecutionSnapshot>>>;
}

/// The resolved persistence backend for one execution.
///
/// Created fresh per execution attempt and discarded at execution end; the
/// resolver never caches a degraded decision. Callers that care about
/// cross-process shared state must check `mode` — a degraded handle is never
/// presented as primary.
#[derive(Clone)]
pub struct BackendHandle {
    pub store: Arc<dyn SnapshotStore>,
    pub mode: BackendMode,
}

impl BackendHandle {
    pub fn primary(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            mode: BackendMode::Primary,
        }
    }

    pub fn degraded(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            mode: BackendMode::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.mode == BackendMode::Degraded
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("mode", &self.mode)
            .finish()
    }
}
