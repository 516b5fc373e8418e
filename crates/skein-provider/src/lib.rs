pub mod cli;
pub mod http;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use skein_core::config::ProvidersConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::types::{AgentSpec, InvokeRequest, Invocation, ProviderKind};

pub use cli::CliAdapter;
pub use http::HttpAdapter;
pub use session::SessionAdapter;

/// Uniform capability wrapper around one agent-execution mechanism.
///
/// One instance serves one role and carries that role's isolation target.
/// Instances are stateless with respect to session identity — the persisted
/// execution state is the only durable home for sessions. Distinct roles may
/// invoke their adapters concurrently; a single role's calls are sequential
/// by graph construction.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    /// Run one task, optionally continuing a previous session.
    ///
    /// Failure kinds are typed (`Invocation`, `InvocationTimeout`,
    /// `Malformed`, `SessionResume`) because the caller's retry policy
    /// differs per kind.
    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, Result<Invocation>>;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Map each agent spec to a concrete adapter instance.
///
/// Pure dispatch — no I/O, no capability negotiation; adapters establish
/// their processes and connections lazily on first use. Duplicate roles are
/// a load-time configuration error.
pub fn resolve_adapters(
    specs: &[AgentSpec],
    providers: &ProvidersConfig,
) -> Result<HashMap<String, Arc<dyn ProviderAdapter>>> {
    let mut seen = HashSet::new();
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

    for spec in specs {
        if !seen.insert(spec.role.clone()) {
            return Err(SkeinError::Config(format!(
                "duplicate agent role '{}'",
                spec.role
            )));
        }

        let adapter: Arc<dyn ProviderAdapter> = match spec.provider {
            ProviderKind::Cli => Arc::new(CliAdapter::new(
                &spec.role,
                &providers.cli,
                spec.isolation.as_deref(),
            )),
            ProviderKind::Session => Arc::new(SessionAdapter::new(
                &spec.role,
                &providers.session,
                spec.isolation.as_deref(),
            )),
            ProviderKind::Http => Arc::new(HttpAdapter::new(
                &spec.role,
                &providers.http,
                spec.isolation.as_deref(),
            )),
        };
        adapters.insert(spec.role.clone(), adapter);
    }

    Ok(adapters)
}
