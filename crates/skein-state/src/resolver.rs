use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use skein_core::config::BackendConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EventBus, RuntimeEvent};
use skein_core::types::{BackendKind, BackendMode};

use crate::backend::{BackendHandle, SnapshotStore};
use crate::postgres::PgStateStore;
use crate::sqlite::SqliteStateStore;

/// Dials the shared backend. The seam exists so tests can substitute a
/// failing or flaky connection without a live database.
pub trait SharedConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn SnapshotStore>>>;
}

struct PgConnector {
    url: String,
}

impl SharedConnector for PgConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn SnapshotStore>>> {
        Box::pin(async move {
            let store = PgStateStore::connect(&self.url).await?;
            Ok(Arc::new(store) as Arc<dyn SnapshotStore>)
        })
    }
}

/// Picks the persistence backend for one execution.
///
/// The embedded path returns immediately; the shared path is retried with
/// exponential backoff and, if still unreachable, the resolver degrades to the
/// embedded store for this execution only. Nothing is remembered between
/// executions — the next one re-attempts the shared backend from scratch.
pub struct BackendResolver {
    config: BackendConfig,
    connector: Option<Arc<dyn SharedConnector>>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for BackendResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendResolver")
            .field("config", &self.config)
            .field("has_connector", &self.connector.is_some())
            .finish()
    }
}

impl BackendResolver {
    pub fn new(config: BackendConfig, events: Arc<EventBus>) -> Result<Self> {
        let connector: Option<Arc<dyn SharedConnector>> = match config.kind {
            BackendKind::Embedded => None,
            BackendKind::Shared => {
                let url = config.url.clone().ok_or_else(|| {
                    SkeinError::Config("backend.kind = \"shared\" requires backend.url".into())
                })?;
                Some(Arc::new(PgConnector { url }))
            }
        };
        Ok(Self {
            config,
            connector,
            events,
        })
    }

    /// Build a resolver with a custom dial step (used by tests).
    pub fn with_connector(
        config: BackendConfig,
        connector: Arc<dyn SharedConnector>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            connector: Some(connector),
            events,
        }
    }

    /// Resolve a backend handle for one execution.
    ///
    /// Never fails for shared-backend reachability reasons; the only error
    /// path is the embedded store itself being unopenable, which is a fatal
    /// configuration problem.
    pub async fn resolve(&self) -> Result<BackendHandle> {
        match self.config.kind {
            BackendKind::Embedded => {
                // No network failure mode, no retry logic.
                let store = self.open_embedded()?;
                self.events.emit(RuntimeEvent::BackendReady {
                    mode: BackendMode::Primary,
                });
                Ok(BackendHandle::primary(store))
            }
            BackendKind::Shared => self.resolve_shared().await,
        }
    }

    async fn resolve_shared(&self) -> Result<BackendHandle> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| SkeinError::Config("shared backend has no connector".into()))?;
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.events.emit(RuntimeEvent::BackendAttempt {
                attempt,
                kind: BackendKind::Shared,
            });

            match Self::dial(connector.as_ref()).await {
                Ok(store) => {
                    info!(attempt, "Shared state backend ready");
                    self.events.emit(RuntimeEvent::BackendReady {
                        mode: BackendMode::Primary,
                    });
                    return Ok(BackendHandle::primary(store));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Shared state backend unreachable");
                    self.events.emit(RuntimeEvent::BackendUnreachable {
                        attempt,
                        error: e.to_string(),
                    });
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff(attempt, self.config.retry.base_backoff_secs))
                            .await;
                    }
                }
            }
        }

        warn!(
            attempts = max_attempts,
            "Shared state backend exhausted, degrading to embedded store for this execution"
        );
        self.events.emit(RuntimeEvent::DegradedFallback);
        let store = self.open_embedded()?;
        self.events.emit(RuntimeEvent::BackendReady {
            mode: BackendMode::Degraded,
        });
        Ok(BackendHandle::degraded(store))
    }

    /// A working connection means the store answers a round trip, not merely
    /// that a socket opened.
    async fn dial(connector: &dyn SharedConnector) -> Result<Arc<dyn SnapshotStore>> {
        let store = connector.connect().await?;
        store.ping().await?;
        Ok(store)
    }

    fn open_embedded(&self) -> Result<Arc<dyn SnapshotStore>> {
        let store = SqliteStateStore::open(&self.config.path)?;
        Ok(Arc::new(store))
    }
}

/// Fixed-base exponential backoff: base, 2*base, 4*base... with upward-only
/// jitter so the floor between attempts is preserved.
fn backoff(attempt: u32, base_secs: u64) -> Duration {
    let ms = base_secs * 1000 * 2u64.pow(attempt.saturating_sub(1));
    let jitter = 1.0 + rand::random::<f64>() * 0.2;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
