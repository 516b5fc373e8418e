use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SkeinError};

/// External key grouping all snapshots of one logical run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which execution mechanism backs an agent role.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// One subprocess per invocation, result on stdout.
    Cli,
    /// Long-lived worker process speaking line-delimited JSON.
    Session,
    /// Stateless HTTP completion endpoint with server-side sessions.
    Http,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Session => "session",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-minted continuation handle for one agent role.
///
/// The adapter mints or extends it; the persisted execution state is its only
/// durable home. Adapters hold no session identity between invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub id: String,
    pub kind: ProviderKind,
}

impl ProviderSession {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// Declarative description of one agent node to splice into a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique identifier; namespaces this agent's state fields.
    pub role: String,
    /// Which adapter variant runs this role.
    pub provider: ProviderKind,
    /// Opaque target handed to the provider (repo path, container name,
    /// workspace id). Never interpreted here.
    #[serde(default)]
    pub isolation: Option<String>,
    /// Insert the agent node after this base node.
    #[serde(default)]
    pub after: Option<String>,
    /// Insert the agent node before this base node.
    #[serde(default)]
    pub before: Option<String>,
    /// Task template rendered against current state. When absent, the agent
    /// receives a context block of all base state fields.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_timeout() -> u64 {
    300
}

/// Where an agent node attaches to the base graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InsertAt {
    After(String),
    Before(String),
}

impl InsertAt {
    pub fn anchor(&self) -> &str {
        match self {
            Self::After(n) | Self::Before(n) => n,
        }
    }
}

impl AgentSpec {
    /// Resolve the insertion point, requiring exactly one of after/before.
    pub fn insertion(&self) -> Result<InsertAt> {
        match (&self.after, &self.before) {
            (Some(node), None) => Ok(InsertAt::After(node.clone())),
            (None, Some(node)) => Ok(InsertAt::Before(node.clone())),
            (Some(_), Some(_)) => Err(SkeinError::Config(format!(
                "agent '{}' sets both 'after' and 'before'",
                self.role
            ))),
            (None, None) => Err(SkeinError::Config(format!(
                "agent '{}' sets neither 'after' nor 'before'",
                self.role
            ))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One provider call, as issued by the engine.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Rendered task text for the agent.
    pub task: String,
    /// Continuation handle from the previous invocation, if any.
    pub session: Option<ProviderSession>,
    pub timeout: Duration,
}

/// Successful provider response.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: String,
    /// Unchanged, extended, or freshly minted by the provider.
    pub session: ProviderSession,
    /// Provider-reported cost estimate in USD.
    pub cost: f64,
}

/// Which durable store family a configuration prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local SQLite file. No network failure mode, never retried.
    Embedded,
    /// Networked Postgres shared across runtime processes.
    Shared,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Shared => "shared",
        }
    }
}

/// How the backend for one execution was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// The configured preference answered.
    Primary,
    /// The shared store was unreachable; this execution runs on the
    /// embedded store. Not shared across processes.
    Degraded,
}
