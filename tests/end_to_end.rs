use std::collections::HashMap;
use std::sync::Arc;

use skein_core::config::AppConfig;
use skein_core::event::{EventBus, RuntimeEvent};
use skein_core::types::ThreadId;
use skein_runtime::Runtime;
use skein_state::{SnapshotStore, SqliteStateStore};

const WORKFLOW: &str = r#"
name = "publish"
entry = "start"

[schema]
topic = "text"
brief = "text"
draft_text = "text"

[[node]]
name = "start"
template = "Prepare a brief for {topic}"
output = "brief"

[[node]]
name = "draft"
template = "Draft the piece: {brief}"
output = "draft_text"

[[edge]]
from = "start"
to = "draft"
"#;

/// Stub provider: answers with a fresh session on first call and extends the
/// session it is resumed with on later calls.
const PROVIDER_SCRIPT: &str = r#"if [ "$0" = "--resume" ]; then printf '{"output":"second pass","session_id":"%s-next","cost_usd":0.2}' "$1"; else printf '{"output":"first pass","session_id":"s-1","cost_usd":0.1}'; fi"#;

fn write_config(dir: &std::path::Path, backend_section: &str) -> std::path::PathBuf {
    let workflow_path = dir.join("workflow.toml");
    std::fs::write(&workflow_path, WORKFLOW).unwrap();

    let config_path = dir.join("skein.toml");
    let config = format!(
        r#"
[workflow]
path = "{workflow}"

{backend}

[[agent]]
role = "reviewer"
provider = "cli"
after = "draft"
timeout_secs = 10

[providers.cli]
command = "sh"
args = ["-c", '''{script}''']
"#,
        workflow = workflow_path.display(),
        backend = backend_section,
        script = PROVIDER_SCRIPT,
    );
    std::fs::write(&config_path, config).unwrap();
    config_path
}

fn input(topic: &str) -> HashMap<String, serde_json::Value> {
    let mut map = HashMap::new();
    map.insert("topic".to_string(), serde_json::json!(topic));
    map
}

#[tokio::test]
async fn test_spliced_agent_run_with_session_continuity() {
    let dir = tempfile::tempdir().unwrap();
    let backend = format!(
        "[backend]\nkind = \"embedded\"\npath = \"{}\"",
        dir.path().join("state.db").display()
    );
    let config_path = write_config(dir.path(), &backend);

    let config = AppConfig::load(&config_path).unwrap();
    let runtime = Runtime::load(config, Arc::new(EventBus::default())).unwrap();
    let thread = ThreadId::from_str("t-publish");

    let first = runtime.execute(input("rust"), thread.clone()).await.unwrap();
    assert_eq!(
        first.final_state["brief"],
        serde_json::json!("Prepare a brief for rust")
    );
    assert_eq!(
        first.final_state["draft_text"],
        serde_json::json!("Draft the piece: Prepare a brief for rust")
    );
    assert_eq!(
        first.final_state["reviewer_output"],
        serde_json::json!("first pass")
    );
    assert_eq!(
        first.final_state["reviewer_session"],
        serde_json::json!("s-1")
    );

    // Second invocation for the same thread resumes the provider session
    // minted by the first.
    let second = runtime.execute(input("rust"), thread).await.unwrap();
    assert_eq!(
        second.final_state["reviewer_output"],
        serde_json::json!("second pass")
    );
    assert_eq!(
        second.final_state["reviewer_session"],
        serde_json::json!("s-1-next")
    );
}

#[tokio::test]
async fn test_unreachable_shared_backend_degrades_and_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let fallback = dir.path().join("fallback.db");
    // Nothing listens on port 9; every connect attempt fails fast.
    let backend = format!(
        "[backend]\nkind = \"shared\"\nurl = \"postgres://skein@127.0.0.1:9/skein\"\npath = \"{}\"",
        fallback.display()
    );
    let config_path = write_config(dir.path(), &backend);

    let config = AppConfig::load(&config_path).unwrap();
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let runtime = Runtime::load(config, events).unwrap();
    let thread = ThreadId::from_str("t-degraded");

    let outcome = runtime.execute(input("rust"), thread.clone()).await.unwrap();
    assert!(outcome.is_degraded());
    assert_eq!(
        outcome.final_state["reviewer_output"],
        serde_json::json!("first pass")
    );

    let mut unreachable = 0;
    let mut fallback_events = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            RuntimeEvent::BackendUnreachable { .. } => unreachable += 1,
            RuntimeEvent::DegradedFallback => fallback_events += 1,
            _ => {}
        }
    }
    assert_eq!(unreachable, 3);
    assert_eq!(fallback_events, 1);

    // The snapshot landed in the embedded fallback store.
    let store = SqliteStateStore::open(&fallback).unwrap();
    let snapshot = store.latest(&thread).await.unwrap().unwrap();
    assert!(snapshot.is_complete());
    assert_eq!(
        snapshot.fields["reviewer_session"],
        serde_json::json!("s-1")
    );
}
