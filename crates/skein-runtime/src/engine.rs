use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use skein_core::error::SkeinError;
use skein_core::event::{EventBus, RuntimeEvent};
use skein_core::types::{InvokeRequest, Invocation, ThreadId};
use skein_graph::definition::render_template;
use skein_graph::splice::{AgentNode, AugmentedGraph, RuntimeNode};
use skein_state::backend::BackendHandle;
use skein_state::snapshot::ExecutionSnapshot;

use crate::ledger::SessionLedger;

/// Structured execution failure: enough to report the failing node and to
/// resume the thread once the cause is fixed.
#[derive(Debug, Error)]
#[error("workflow failed at node '{node}' (thread {thread_id}): {source}")]
pub struct RunError {
    pub thread_id: ThreadId,
    pub node: String,
    #[source]
    pub source: SkeinError,
}

impl RunError {
    /// Machine-readable failure kind (e.g. "timeout", "conflict").
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

/// Graph-execution engine interface consumed by the runtime.
pub trait WorkflowEngine: Send + Sync {
    /// Drive one execution for a thread; returns the final state.
    fn run(
        &self,
        input: HashMap<String, serde_json::Value>,
        thread_id: ThreadId,
    ) -> BoxFuture<'_, std::result::Result<HashMap<String, serde_json::Value>, RunError>>;
}

/// Minimal in-process engine: walks the augmented graph one node per step and
/// commits a snapshot after every completed node.
///
/// A node's writes stay in scratch state until its snapshot lands, so a
/// failing node leaves the thread's persisted state exactly where the previous
/// step committed it.
pub struct StepEngine {
    graph: Arc<AugmentedGraph>,
    backend: BackendHandle,
    events: Arc<EventBus>,
}

impl StepEngine {
    pub fn new(graph: Arc<AugmentedGraph>, backend: BackendHandle, events: Arc<EventBus>) -> Self {
        Self {
            graph,
            backend,
            events,
        }
    }

    fn fail(&self, thread_id: &ThreadId, node: &str, source: SkeinError) -> RunError {
        error!(node, thread_id = %thread_id, error = %source, "Workflow node failed");
        self.events.emit(RuntimeEvent::RunFailed {
            thread_id: thread_id.to_string(),
            node: node.to_string(),
            error: source.to_string(),
        });
        RunError {
            thread_id: thread_id.clone(),
            node: node.to_string(),
            source,
        }
    }

    async fn run_inner(
        &self,
        input: HashMap<String, serde_json::Value>,
        thread_id: ThreadId,
    ) -> std::result::Result<HashMap<String, serde_json::Value>, RunError> {
        let graph = &self.graph;

        let loaded = self
            .backend
            .store
            .latest(&thread_id)
            .await
            .map_err(|e| self.fail(&thread_id, &graph.entry, e))?;

        // A completed thread restarts at the entry with its fields (and
        // sessions) intact; an interrupted one resumes at its cursor.
        let (mut previous, mut fields, mut current) = match loaded {
            Some(snap) => {
                let mut fields = snap.fields.clone();
                fields.extend(input);
                let cursor = snap.cursor.clone().unwrap_or_else(|| graph.entry.clone());
                info!(thread_id = %thread_id, step = snap.step, cursor = %cursor, "Resuming thread");
                (Some(snap), fields, cursor)
            }
            None => {
                let mut fields: HashMap<String, serde_json::Value> = graph
                    .schema
                    .iter()
                    .map(|(name, kind)| (name.clone(), kind.empty_value()))
                    .collect();
                fields.extend(input);
                (None, fields, graph.entry.clone())
            }
        };

        loop {
            let node = graph.node(&current).ok_or_else(|| {
                self.fail(
                    &thread_id,
                    &current,
                    SkeinError::Config(format!("node '{}' not found in graph", current)),
                )
            })?;

            debug!(node = %current, thread_id = %thread_id, "Executing workflow node");
            let mut scratch = fields.clone();
            match node {
                RuntimeNode::Transform { template, output } => {
                    let rendered = render_template(template, &fields);
                    scratch.insert(output.clone(), serde_json::Value::String(rendered));
                }
                RuntimeNode::Agent(agent) => {
                    self.run_agent(agent, &fields, &mut scratch)
                        .await
                        .map_err(|e| self.fail(&thread_id, &current, e))?;
                }
            }

            let next = graph.successor(&current).map(String::from);
            let snapshot = match &previous {
                Some(prev) => prev.next(next.clone(), scratch.clone()),
                None => ExecutionSnapshot::first(thread_id.clone(), next.clone(), scratch.clone()),
            };
            self.backend
                .store
                .put(&snapshot)
                .await
                .map_err(|e| self.fail(&thread_id, &current, e))?;
            self.events.emit(RuntimeEvent::StepCommitted {
                thread_id: thread_id.to_string(),
                step: snapshot.step,
                version: snapshot.version,
            });

            fields = scratch;
            previous = Some(snapshot);
            match next {
                Some(n) => current = n,
                None => break,
            }
        }

        Ok(fields)
    }

    /// One agent invocation, wired through the session ledger.
    ///
    /// The role's session field is read before the call and the returned
    /// session is staged next to the output so both commit in one snapshot.
    /// A rejected continuation is retried exactly once with a fresh session;
    /// if the retry is rejected too, the failure is reported as a plain
    /// invocation failure. Every other failure kind propagates untouched.
    async fn run_agent(
        &self,
        agent: &AgentNode,
        fields: &HashMap<String, serde_json::Value>,
        scratch: &mut HashMap<String, serde_json::Value>,
    ) -> skein_core::error::Result<()> {
        let session = SessionLedger::read(fields, &agent.role, agent.adapter.kind());
        let task = match &agent.task {
            Some(template) => render_template(template, fields),
            None => context_block(fields),
        };

        self.events.emit(RuntimeEvent::AgentStarted {
            role: agent.role.clone(),
        });
        let started = Instant::now();

        let request = InvokeRequest {
            task: task.clone(),
            session: session.clone(),
            timeout: agent.timeout,
        };

        let invocation: Invocation = match agent.adapter.invoke(request).await {
            Ok(invocation) => invocation,
            Err(SkeinError::SessionResume { message, .. }) if session.is_some() => {
                // A stale session is recoverable by forgetting it.
                warn!(role = %agent.role, reason = %message, "Provider rejected session, restarting fresh");
                self.events.emit(RuntimeEvent::SessionReset {
                    role: agent.role.clone(),
                });
                agent
                    .adapter
                    .invoke(InvokeRequest {
                        task,
                        session: None,
                        timeout: agent.timeout,
                    })
                    .await
                    .map_err(|e| match e {
                        SkeinError::SessionResume { role, message } => {
                            SkeinError::Invocation { role, message }
                        }
                        other => other,
                    })?
            }
            Err(e) => return Err(e),
        };

        SessionLedger::stage(scratch, agent, &invocation);
        self.events.emit(RuntimeEvent::AgentFinished {
            role: agent.role.clone(),
            cost: invocation.cost,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }
}

impl WorkflowEngine for StepEngine {
    fn run(
        &self,
        input: HashMap<String, serde_json::Value>,
        thread_id: ThreadId,
    ) -> BoxFuture<'_, std::result::Result<HashMap<String, serde_json::Value>, RunError>> {
        Box::pin(self.run_inner(input, thread_id))
    }
}

/// Default agent task when a spec carries no template: a context block of the
/// current state, session and cost bookkeeping excluded.
fn context_block(fields: &HashMap<String, serde_json::Value>) -> String {
    let mut keys: Vec<&String> = fields
        .keys()
        .filter(|k| !k.ends_with("_session") && !k.ends_with("_cost"))
        .collect();
    keys.sort();

    let mut block = String::from("## Context Data\n\n");
    for key in keys {
        if let Some(value) = fields.get(key) {
            let display = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            block.push_str(&format!("**{}**: {}\n", key, display));
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use skein_core::types::{ProviderKind, ProviderSession};
    use skein_graph::definition::WorkflowDefinition;
    use skein_graph::splice::splice;
    use skein_provider::ProviderAdapter;
    use skein_state::backend::SnapshotStore;
    use skein_state::sqlite::SqliteStateStore;

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

    /// Mints s-1, s-2, ... and records the session each call received.
    struct MintingAdapter {
        calls: AtomicU32,
        seen: Mutex<Vec<Option<String>>>,
        tasks: Mutex<Vec<String>>,
    }

    impl MintingAdapter {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                seen: Mutex::new(vec![]),
                tasks: Mutex::new(vec![]),
            }
        }
    }

    impl ProviderAdapter for MintingAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Cli
        }

        fn invoke(
            &self,
            request: InvokeRequest,
        ) -> BoxFuture<'_, skein_core::error::Result<Invocation>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push(request.session.map(|s| s.id));
                self.tasks.lock().unwrap().push(request.task);
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Invocation {
                    output: format!("review {}", n),
                    session: ProviderSession::new(format!("s-{}", n), ProviderKind::Cli),
                    cost: 0.01,
                })
            })
        }
    }

    /// Rejects continuations; succeeds when called without a session.
    struct ResettingAdapter {
        reject_fresh_too: bool,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl ProviderAdapter for ResettingAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Session
        }

        fn invoke(
            &self,
            request: InvokeRequest,
        ) -> BoxFuture<'_, skein_core::error::Result<Invocation>> {
            Box::pin(async move {
                let session = request.session.map(|s| s.id);
                self.seen.lock().unwrap().push(session.clone());
                if session.is_some() || self.reject_fresh_too {
                    Err(SkeinError::SessionResume {
                        role: "reviewer".into(),
                        message: "session expired".into(),
                    })
                } else {
                    Ok(Invocation {
                        output: "fresh review".into(),
                        session: ProviderSession::new("fresh-1", ProviderKind::Session),
                        cost: 0.02,
                    })
                }
            })
        }
    }

    struct FailingAdapter;

    impl ProviderAdapter for FailingAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Cli
        }

        fn invoke(
            &self,
            _request: InvokeRequest,
        ) -> BoxFuture<'_, skein_core::error::Result<Invocation>> {
            Box::pin(async {
                Err(SkeinError::Invocation {
                    role: "reviewer".into(),
                    message: "provider crashed".into(),
                })
            })
        }
    }

    fn reviewer_spec() -> skein_core::types::AgentSpec {
        skein_core::types::AgentSpec {
            role: "reviewer".into(),
            provider: ProviderKind::Cli,
            isolation: None,
            after: Some("draft".into()),
            before: None,
            task: None,
            timeout_secs: 30,
        }
    }

    fn graph_with(adapter: Arc<dyn ProviderAdapter>) -> Arc<AugmentedGraph> {
        let base = WorkflowDefinition::parse(NOTE).unwrap();
        let mut adapters = HashMap::new();
        adapters.insert("reviewer".to_string(), adapter);
        Arc::new(splice(&base, &[reviewer_spec()], &adapters).unwrap())
    }

    fn backend() -> (Arc<SqliteStateStore>, BackendHandle) {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        (store.clone(), BackendHandle::primary(store))
    }

    fn input(topic: &str) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("topic".to_string(), serde_json::json!(topic));
        map
    }

    #[tokio::test]
    async fn test_run_commits_one_snapshot_per_node() {
        let (store, handle) = backend();
        let adapter = Arc::new(MintingAdapter::new());
        let engine = StepEngine::new(
            graph_with(adapter.clone()),
            handle,
            Arc::new(EventBus::default()),
        );

        let thread = ThreadId::from_str("t-1");
        let state = engine.run(input("rust"), thread.clone()).await.unwrap();

        assert_eq!(state["draft_text"], serde_json::json!("Draft: rust"));
        assert_eq!(state["reviewer_output"], serde_json::json!("review 1"));
        assert_eq!(state["reviewer_session"], serde_json::json!("s-1"));

        let latest = store.latest(&thread).await.unwrap().unwrap();
        assert_eq!(latest.step, 2);
        assert_eq!(latest.version, 2);
        assert!(latest.is_complete());
    }

    #[tokio::test]
    async fn test_session_round_trip_across_invocations() {
        let (store, handle) = backend();
        let adapter = Arc::new(MintingAdapter::new());
        let graph = graph_with(adapter.clone());
        let thread = ThreadId::from_str("t-1");

        let first = StepEngine::new(graph.clone(), handle.clone(), Arc::new(EventBus::default()));
        first.run(input("rust"), thread.clone()).await.unwrap();

        let second = StepEngine::new(graph, handle, Arc::new(EventBus::default()));
        let state = second.run(input("rust"), thread.clone()).await.unwrap();

        // The second invocation received the token minted by the first.
        let seen = adapter.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some("s-1".to_string())]);
        assert_eq!(state["reviewer_session"], serde_json::json!("s-2"));

        let latest = store.latest(&thread).await.unwrap().unwrap();
        assert_eq!(latest.version, 4);
    }

    #[tokio::test]
    async fn test_failed_node_leaves_snapshot_untouched() {
        let (store, handle) = backend();
        let engine = StepEngine::new(
            graph_with(Arc::new(FailingAdapter)),
            handle,
            Arc::new(EventBus::default()),
        );

        let thread = ThreadId::from_str("t-1");
        let err = engine.run(input("rust"), thread.clone()).await.unwrap_err();
        assert_eq!(err.node, "reviewer");
        assert_eq!(err.kind(), "invocation_failure");

        // Only the draft step is committed; no reviewer fields leaked.
        let latest = store.latest(&thread).await.unwrap().unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.cursor.as_deref(), Some("reviewer"));
        assert_eq!(
            latest.fields["reviewer_output"],
            serde_json::json!(""),
            "agent output must not be partially applied"
        );
    }

    #[tokio::test]
    async fn test_resume_from_last_committed_snapshot() {
        let (store, handle) = backend();
        let thread = ThreadId::from_str("t-1");

        let broken = StepEngine::new(
            graph_with(Arc::new(FailingAdapter)),
            handle.clone(),
            Arc::new(EventBus::default()),
        );
        broken.run(input("rust"), thread.clone()).await.unwrap_err();

        // Same thread, provider recovered: execution resumes at the failed
        // node instead of restarting from scratch.
        let adapter = Arc::new(MintingAdapter::new());
        let engine = StepEngine::new(
            graph_with(adapter.clone()),
            handle,
            Arc::new(EventBus::default()),
        );
        let state = engine
            .run(HashMap::new(), thread.clone())
            .await
            .unwrap();

        assert_eq!(state["reviewer_output"], serde_json::json!("review 1"));
        let latest = store.latest(&thread).await.unwrap().unwrap();
        assert_eq!(latest.step, 2);

        // The draft node did not run again.
        let tasks = adapter.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].contains("Draft: rust"));
    }

    #[tokio::test]
    async fn test_stale_session_reset_once_and_recovered() {
        let (store, handle) = backend();
        let adapter = Arc::new(ResettingAdapter {
            reject_fresh_too: false,
            seen: Mutex::new(vec![]),
        });
        let graph = graph_with(adapter.clone());
        let thread = ThreadId::from_str("t-1");

        // Seed a committed step whose cursor is the agent node and whose
        // ledger field holds a stale session.
        let mut fields: HashMap<String, serde_json::Value> = graph
            .schema
            .iter()
            .map(|(name, kind)| (name.clone(), kind.empty_value()))
            .collect();
        fields.insert("draft_text".into(), serde_json::json!("Draft: rust"));
        fields.insert("reviewer_session".into(), serde_json::json!("stale-7"));
        store
            .put(&ExecutionSnapshot::first(
                thread.clone(),
                Some("reviewer".into()),
                fields,
            ))
            .await
            .unwrap();

        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let engine = StepEngine::new(graph, handle, events);
        let state = engine.run(HashMap::new(), thread.clone()).await.unwrap();

        let seen = adapter.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some("stale-7".to_string()), None]);
        assert_eq!(state["reviewer_session"], serde_json::json!("fresh-1"));
        assert_eq!(state["reviewer_output"], serde_json::json!("fresh review"));

        let mut resets = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RuntimeEvent::SessionReset { .. }) {
                resets += 1;
            }
        }
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn test_failed_reset_reported_as_invocation_failure() {
        let (store, handle) = backend();
        let adapter = Arc::new(ResettingAdapter {
            reject_fresh_too: true,
            seen: Mutex::new(vec![]),
        });
        let graph = graph_with(adapter.clone());
        let thread = ThreadId::from_str("t-1");

        let mut fields: HashMap<String, serde_json::Value> = graph
            .schema
            .iter()
            .map(|(name, kind)| (name.clone(), kind.empty_value()))
            .collect();
        fields.insert("reviewer_session".into(), serde_json::json!("stale-7"));
        store
            .put(&ExecutionSnapshot::first(
                thread.clone(),
                Some("reviewer".into()),
                fields,
            ))
            .await
            .unwrap();

        let engine = StepEngine::new(graph, handle, Arc::new(EventBus::default()));
        let err = engine.run(HashMap::new(), thread).await.unwrap_err();
        assert_eq!(err.kind(), "invocation_failure");
        assert_eq!(adapter.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writer_surfaces_conflict() {
        let (store, handle) = backend();
        let thread = ThreadId::from_str("t-1");

        /// Writes a competing snapshot while "working", as a second runtime
        /// process would.
        struct RacingAdapter {
            store: Arc<SqliteStateStore>,
            thread: ThreadId,
        }

        impl ProviderAdapter for RacingAdapter {
            fn kind(&self) -> ProviderKind {
                ProviderKind::Cli
            }

            fn invoke(
                &self,
                _request: InvokeRequest,
            ) -> BoxFuture<'_, skein_core::error::Result<Invocation>> {
                Box::pin(async move {
                    let latest = self.store.latest(&self.thread).await?.unwrap();
                    self.store.put(&latest.next(None, latest.fields.clone())).await?;
                    Ok(Invocation {
                        output: "raced".into(),
                        session: ProviderSession::new("s-x", ProviderKind::Cli),
                        cost: 0.0,
                    })
                })
            }
        }

        let adapter = Arc::new(RacingAdapter {
            store: store.clone(),
            thread: thread.clone(),
        });
        let graph = graph_with(adapter);

        let mut fields: HashMap<String, serde_json::Value> = graph
            .schema
            .iter()
            .map(|(name, kind)| (name.clone(), kind.empty_value()))
            .collect();
        fields.insert("draft_text".into(), serde_json::json!("Draft: rust"));
        store
            .put(&ExecutionSnapshot::first(
                thread.clone(),
                Some("reviewer".into()),
                fields,
            ))
            .await
            .unwrap();

        let engine = StepEngine::new(graph, handle, Arc::new(EventBus::default()));
        let err = engine.run(HashMap::new(), thread).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_context_block_skips_bookkeeping_fields() {
        let mut fields = HashMap::new();
        fields.insert("draft_text".to_string(), serde_json::json!("the draft"));
        fields.insert("reviewer_session".to_string(), serde_json::json!("s-1"));
        fields.insert("reviewer_cost".to_string(), serde_json::json!(0.5));

        let block = context_block(&fields);
        assert!(block.contains("**draft_text**: the draft"));
        assert!(!block.contains("reviewer_session"));
        assert!(!block.contains("reviewer_cost"));
    }
}
