use serde::Serialize;

use crate::types::{BackendKind, BackendMode};

/// Structured runtime event for the telemetry sink.
///
/// Events are observational only: emission must never block or fail the
/// operation being reported.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// One connection attempt against the preferred backend.
    BackendAttempt { attempt: u32, kind: BackendKind },
    /// The attempt failed; another may follow after backoff.
    BackendUnreachable { attempt: u32, error: String },
    /// All shared attempts failed; this execution falls back to the
    /// embedded store.
    DegradedFallback,
    /// Resolution finished.
    BackendReady { mode: BackendMode },
    AgentStarted { role: String },
    AgentFinished { role: String, cost: f64, elapsed_ms: u64 },
    /// A stale provider session was forgotten and the role restarted fresh.
    SessionReset { role: String },
    StepCommitted { thread_id: String, step: u64, version: u64 },
    WorkflowReloaded { generation: u64 },
    RunFailed { thread_id: String, node: String, error: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; emission is fire-and-forget.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
