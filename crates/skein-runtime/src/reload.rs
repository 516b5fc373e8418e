use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use skein_core::event::{EventBus, RuntimeEvent};
use skein_graph::definition::WorkflowDefinition;

/// Process-wide holder of the active workflow definition.
///
/// The definition is a versioned, immutable snapshot: readers always get a
/// consistent whole, and a proposed replacement is applied only at the
/// boundary between two executions — never under an execution in flight,
/// which keeps its own `Arc` to the definition it started with.
pub struct WorkflowCell {
    inner: Mutex<CellInner>,
    events: Arc<EventBus>,
}

struct CellInner {
    active: Arc<WorkflowDefinition>,
    pending: Option<Arc<WorkflowDefinition>>,
    generation: u64,
}

impl WorkflowCell {
    pub fn new(definition: WorkflowDefinition, events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                active: Arc::new(definition),
                pending: None,
                generation: 1,
            }),
            events,
        }
    }

    /// Stage a replacement definition for the next execution boundary.
    pub fn propose(&self, definition: WorkflowDefinition) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending = Some(Arc::new(definition));
    }

    /// Definition for the next execution, applying any pending reload first.
    pub fn acquire(&self) -> (Arc<WorkflowDefinition>, u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = inner.pending.take() {
            inner.active = pending;
            inner.generation += 1;
            info!(generation = inner.generation, "Workflow reload applied");
            self.events.emit(RuntimeEvent::WorkflowReloaded {
                generation: inner.generation,
            });
        }
        (inner.active.clone(), inner.generation)
    }

    pub fn generation(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }
}

/// Fingerprint used to detect definition file changes.
fn fingerprint(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Watch the definition file and propose reloads.
///
/// A definition that fails to parse or validate is rejected with a warning;
/// the active one stays in place. `validate` lets the caller add checks
/// beyond the definition's own (the runtime passes a splice dry-run so a
/// reload can never strand the configured agents).
pub fn spawn_watcher<F>(
    cell: Arc<WorkflowCell>,
    path: PathBuf,
    poll_interval: Duration,
    validate: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&WorkflowDefinition) -> skein_core::error::Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = fingerprint(&path);

        loop {
            interval.tick().await;
            let current = fingerprint(&path);
            if current.is_none() || current == last {
                continue;
            }
            last = current;

            match WorkflowDefinition::load(&path) {
                Ok(definition) => match validate(&definition) {
                    Ok(()) => {
                        info!(path = %path.display(), workflow = %definition.name, "Workflow change staged");
                        cell.propose(definition);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Ignoring workflow reload: agents no longer splice");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring invalid workflow reload");
                }
            }
        }
    })
}
