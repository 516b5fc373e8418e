use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use skein_core::config::HttpProviderConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::types::{InvokeRequest, Invocation, ProviderKind, ProviderSession};

use crate::ProviderAdapter;

/// Stateless HTTP completion adapter.
///
/// The server keeps session state; the adapter just echoes the session id it
/// was handed and stores whatever id the server returns.
pub struct HttpAdapter {
    role: String,
    endpoint: String,
    api_key: Option<String>,
    workspace: Option<String>,
    http: Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workspace: Option<&'a str>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    output: String,
    session: String,
    #[serde(default)]
    cost: f64,
}

impl HttpAdapter {
    pub fn new(role: &str, config: &HttpProviderConfig, isolation: Option<&str>) -> Self {
        Self {
            role: role.to_string(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            workspace: isolation.map(String::from),
            http: Client::new(),
        }
    }

    /// Map a non-success completion status to the typed failure the caller's
    /// retry policy keys on.
    fn status_error(&self, status: StatusCode, body: &str, had_session: bool) -> SkeinError {
        // Completion servers answer a dead continuation with 409/410.
        if had_session && matches!(status, StatusCode::CONFLICT | StatusCode::GONE) {
            return SkeinError::SessionResume {
                role: self.role.clone(),
                message: format!("{}: {}", status, body.trim()),
            };
        }
        SkeinError::Invocation {
            role: self.role.clone(),
            message: format!("{}: {}", status, body.trim()),
        }
    }

    fn decode(&self, body: &str) -> Result<Invocation> {
        let parsed: CompletionResponse =
            serde_json::from_str(body).map_err(|e| SkeinError::Malformed {
                role: self.role.clone(),
                message: e.to_string(),
            })?;
        Ok(Invocation {
            output: parsed.output,
            session: ProviderSession::new(parsed.session, ProviderKind::Http),
            cost: parsed.cost,
        })
    }
}

impl ProviderAdapter for HttpAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, Result<Invocation>> {
        Box::pin(async move {
            let payload = CompletionRequest {
                task: &request.task,
                session: request.session.as_ref().map(|s| s.id.as_str()),
                workspace: self.workspace.as_deref(),
            };

            debug!(role = %self.role, endpoint = %self.endpoint, resuming = request.session.is_some(), "Posting completion request");

            let mut builder = self
                .http
                .post(&self.endpoint)
                .timeout(request.timeout)
                .json(&payload);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    SkeinError::InvocationTimeout {
                        role: self.role.clone(),
                        timeout_secs: request.timeout.as_secs(),
                    }
                } else {
                    SkeinError::Invocation {
                        role: self.role.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            let status = response.status();
            let body = response.text().await.map_err(|e| SkeinError::Invocation {
                role: self.role.clone(),
                message: e.to_string(),
            })?;

            if !status.is_success() {
                return Err(self.status_error(status, &body, request.session.is_some()));
            }

            self.decode(&body)
        })
    }
}
