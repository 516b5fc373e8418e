use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use skein_core::config::CliProviderConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::types::{InvokeRequest, Invocation, ProviderKind, ProviderSession};

use crate::ProviderAdapter;

/// Subprocess-based adapter: one child process per invocation, JSON result on
/// stdout. Session continuity is requested with `--resume <id>`; the provider
/// mints a new session id when none is passed.
pub struct CliAdapter {
    role: String,
    command: String,
    args: Vec<String>,
    /// Isolation target, used as the child's working directory.
    workdir: Option<PathBuf>,
}

/// Expected stdout shape.
#[derive(Deserialize)]
struct CliResponse {
    output: String,
    session_id: String,
    #[serde(default)]
    cost_usd: f64,
}

impl CliAdapter {
    pub fn new(role: &str, config: &CliProviderConfig, isolation: Option<&str>) -> Self {
        Self {
            role: role.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            workdir: isolation.map(PathBuf::from),
        }
    }

    fn invocation_err(&self, message: impl Into<String>) -> SkeinError {
        SkeinError::Invocation {
            role: self.role.clone(),
            message: message.into(),
        }
    }
}

/// Whether provider stderr describes a rejected session continuation.
fn is_stale_session(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("session") && (s.contains("not found") || s.contains("expired") || s.contains("unknown"))
}

impl ProviderAdapter for CliAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cli
    }

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, Result<Invocation>> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&self.command);
            cmd.args(&self.args);
            if let Some(session) = &request.session {
                cmd.arg("--resume").arg(&session.id);
            }
            cmd.arg(&request.task);
            if let Some(dir) = &self.workdir {
                cmd.current_dir(dir);
            }
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // Dropping the in-flight future (timeout path) must not leave
                // an orphaned child behind.
                .kill_on_drop(true);

            debug!(role = %self.role, command = %self.command, resuming = request.session.is_some(), "Spawning provider process");

            let result = tokio::time::timeout(request.timeout, cmd.output()).await;

            let output = match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(self.invocation_err(format!("spawn failed: {}", e))),
                Err(_) => {
                    return Err(SkeinError::InvocationTimeout {
                        role: self.role.clone(),
                        timeout_secs: request.timeout.as_secs(),
                    });
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output.status.code().unwrap_or(-1);
                if request.session.is_some() && is_stale_session(&stderr) {
                    return Err(SkeinError::SessionResume {
                        role: self.role.clone(),
                        message: stderr.trim().to_string(),
                    });
                }
                return Err(self.invocation_err(format!("exit code {}: {}", code, stderr.trim())));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let parsed: CliResponse =
                serde_json::from_str(stdout.trim()).map_err(|e| SkeinError::Malformed {
                    role: self.role.clone(),
                    message: format!("{} (stdout: {})", e, truncate(&stdout, 200)),
                })?;

            Ok(Invocation {
                output: parsed.output,
                session: ProviderSession::new(parsed.session_id, ProviderKind::Cli),
                cost: parsed.cost_usd,
            })
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim().to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
