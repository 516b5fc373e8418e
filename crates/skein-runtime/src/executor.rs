use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use skein_core::config::AppConfig;
use skein_core::error::Result;
use skein_core::event::EventBus;
use skein_core::types::{BackendMode, ThreadId};
use skein_graph::definition::WorkflowDefinition;
use skein_graph::splice::splice;
use skein_provider::{resolve_adapters, ProviderAdapter};
use skein_state::resolver::BackendResolver;

use crate::engine::{RunError, StepEngine, WorkflowEngine};
use crate::reload::{spawn_watcher, WorkflowCell};

/// Result of one completed execution.
#[derive(Debug)]
pub struct RunOutcome {
    pub thread_id: ThreadId,
    pub final_state: HashMap<String, serde_json::Value>,
    /// How the backend for this execution was obtained. Degraded means the
    /// snapshot lives in the local embedded store, not the shared one.
    pub backend_mode: BackendMode,
    /// Definition generation this execution ran against.
    pub generation: u64,
}

impl RunOutcome {
    pub fn is_degraded(&self) -> bool {
        self.backend_mode == BackendMode::Degraded
    }
}

/// Top-level orchestrator: loads the workflow, resolves a backend per
/// execution, splices the configured agents in, and drives the engine.
pub struct Runtime {
    config: AppConfig,
    cell: Arc<WorkflowCell>,
    adapters: Arc<HashMap<String, Arc<dyn ProviderAdapter>>>,
    events: Arc<EventBus>,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("agents", &self.adapters.keys().collect::<Vec<_>>())
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl Runtime {
    /// Load and validate everything that must hold before a first execution:
    /// the definition parses, every agent resolves to an adapter, and the
    /// splice is structurally sound.
    pub fn load(config: AppConfig, events: Arc<EventBus>) -> Result<Self> {
        config.validate()?;
        let definition = WorkflowDefinition::load(&config.workflow.path)?;
        let adapters = Arc::new(resolve_adapters(&config.agents, &config.providers)?);
        splice(&definition, &config.agents, &adapters)?;

        info!(
            workflow = %definition.name,
            agents = config.agents.len(),
            "Workflow loaded"
        );

        let cell = Arc::new(WorkflowCell::new(definition, events.clone()));
        let watcher = if config.workflow.watch {
            let specs = config.agents.clone();
            let check_adapters = adapters.clone();
            Some(spawn_watcher(
                cell.clone(),
                config.workflow.path.clone(),
                Duration::from_secs(config.workflow.poll_interval_secs),
                move |definition| {
                    splice(definition, &specs, &check_adapters).map(|_| ())
                },
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            cell,
            adapters,
            events,
            watcher,
        })
    }

    /// Drive one execution for a thread.
    ///
    /// Any pending workflow reload is applied here, at the boundary; the
    /// backend is resolved fresh so a degraded fallback never outlives the
    /// execution that needed it.
    pub async fn execute(
        &self,
        input: HashMap<String, serde_json::Value>,
        thread_id: ThreadId,
    ) -> std::result::Result<RunOutcome, RunError> {
        let (definition, generation) = self.cell.acquire();

        let resolver = BackendResolver::new(self.config.backend.clone(), self.events.clone())
            .map_err(|e| self.setup_failure(&thread_id, e))?;
        let backend = resolver
            .resolve()
            .await
            .map_err(|e| self.setup_failure(&thread_id, e))?;
        let backend_mode = backend.mode;

        let graph = splice(&definition, &self.config.agents, &self.adapters)
            .map_err(|e| self.setup_failure(&thread_id, e))?;

        let engine = StepEngine::new(Arc::new(graph), backend, self.events.clone());
        let final_state = engine.run(input, thread_id.clone()).await?;

        Ok(RunOutcome {
            thread_id,
            final_state,
            backend_mode,
            generation,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn setup_failure(&self, thread_id: &ThreadId, source: skein_core::SkeinError) -> RunError {
        RunError {
            thread_id: thread_id.clone(),
            node: "<setup>".to_string(),
            source,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::config::{BackendConfig, CliProviderConfig, WorkflowConfig};
    use skein_core::types::{AgentSpec, BackendKind, ProviderKind};

    const NOTE: &str = r#"
name = "note"
entry = "draft"

[schema]
topic = "text"
draft_text = "text"

[[node]]
name = "draft"
template = "Draft: {topic}"
output = "draft_text"
"#;

    fn write_workflow(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("workflow.toml");
        std::fs::write(&path, NOTE).unwrap();
        path
    }

    fn config(dir: &std::path::Path, agents: Vec<AgentSpec>) -> AppConfig {
        AppConfig {
            workflow: WorkflowConfig {
                path: write_workflow(dir),
                watch: false,
                poll_interval_secs: 2,
            },
            backend: BackendConfig {
                kind: BackendKind::Embedded,
                path: dir.join("state.db"),
                ..Default::default()
            },
            agents,
            providers: {
                let mut providers = skein_core::config::ProvidersConfig::default();
                providers.cli = CliProviderConfig {
                    command: "sh".into(),
                    args: vec![
                        "-c".into(),
                        r#"echo '{"output":"ship it","session_id":"s-1","cost_usd":0.1}'"#.into(),
                    ],
                };
                providers
            },
            features: HashMap::new(),
        }
    }

    fn reviewer() -> AgentSpec {
        AgentSpec {
            role: "reviewer".into(),
            provider: ProviderKind::Cli,
            isolation: None,
            after: Some("draft".into()),
            before: None,
            task: None,
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_execute_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let runtime =
            Runtime::load(config(dir.path(), vec![reviewer()]), Arc::new(EventBus::default()))
                .unwrap();

        let mut input = HashMap::new();
        input.insert("topic".to_string(), serde_json::json!("rust"));
        let outcome = runtime
            .execute(input, ThreadId::from_str("t-1"))
            .await
            .unwrap();

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.generation, 1);
        assert_eq!(
            outcome.final_state["draft_text"],
            serde_json::json!("Draft: rust")
        );
        assert_eq!(
            outcome.final_state["reviewer_output"],
            serde_json::json!("ship it")
        );
        assert_eq!(
            outcome.final_state["reviewer_session"],
            serde_json::json!("s-1")
        );
    }

    #[tokio::test]
    async fn test_load_rejects_dangling_insertion_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = reviewer();
        spec.after = Some("ghost".into());

        let err = Runtime::load(config(dir.path(), vec![spec]), Arc::new(EventBus::default()))
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[tokio::test]
    async fn test_load_rejects_duplicate_roles() {
        let dir = tempfile::tempdir().unwrap();
        let err = Runtime::load(
            config(dir.path(), vec![reviewer(), reviewer()]),
            Arc::new(EventBus::default()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[tokio::test]
    async fn test_reload_applies_between_executions() {
        let dir = tempfile::tempdir().unwrap();
        let runtime =
            Runtime::load(config(dir.path(), vec![reviewer()]), Arc::new(EventBus::default()))
                .unwrap();

        let first = runtime
            .execute(HashMap::new(), ThreadId::from_str("t-1"))
            .await
            .unwrap();
        assert_eq!(first.generation, 1);

        runtime
            .cell
            .propose(WorkflowDefinition::parse(NOTE).unwrap());

        let second = runtime
            .execute(HashMap::new(), ThreadId::from_str("t-2"))
            .await
            .unwrap();
        assert_eq!(second.generation, 2);
    }
}
