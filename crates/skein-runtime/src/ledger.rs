use std::collections::HashMap;

use skein_core::types::{Invocation, ProviderKind, ProviderSession};
use skein_graph::AgentNode;

/// The session ledger is not a separate store: it is the convention that
/// `{role}_session` fields live inside the persisted execution state, read
/// before each agent invocation and written back together with the agent's
/// output.
pub struct SessionLedger;

impl SessionLedger {
    /// Last-known continuation handle for a role, absent on first run.
    ///
    /// The schema seeds session fields with an empty string, which reads as
    /// "no session yet".
    pub fn read(
        fields: &HashMap<String, serde_json::Value>,
        role: &str,
        kind: ProviderKind,
    ) -> Option<ProviderSession> {
        fields
            .get(&format!("{}_session", role))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| ProviderSession::new(s, kind))
    }

    /// Stage an agent result into the scratch state.
    ///
    /// Output, session, and cost land in one map so they are committed in the
    /// same snapshot — session continuity and output production must not be
    /// separable into two persisted steps.
    pub fn stage(
        scratch: &mut HashMap<String, serde_json::Value>,
        node: &AgentNode,
        invocation: &Invocation,
    ) {
        scratch.insert(
            node.output_field(),
            serde_json::Value::String(invocation.output.clone()),
        );
        scratch.insert(
            node.session_field(),
            serde_json::Value::String(invocation.session.id.clone()),
        );
        scratch.insert(node.cost_field(), serde_json::json!(invocation.cost));
    }
}
