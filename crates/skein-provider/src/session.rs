use std::process::Stdio;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use skein_core::config::SessionProviderConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::types::{InvokeRequest, Invocation, ProviderKind, ProviderSession};

use crate::ProviderAdapter;

/// Long-lived session-protocol adapter.
///
/// One worker child per adapter instance, spawned lazily on first use and
/// speaking line-delimited JSON over stdin/stdout. The worker owns the
/// provider-side session machinery; this adapter only forwards the session id
/// it is handed and returns whatever id the worker reports back.
pub struct SessionAdapter {
    role: String,
    command: String,
    args: Vec<String>,
    isolation: Option<String>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    lines: FramedRead<ChildStdout, LinesCodec>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    task: &'a str,
    session: Option<&'a str>,
    workspace: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    session: String,
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    kind: String,
}

impl SessionAdapter {
    pub fn new(role: &str, config: &SessionProviderConfig, isolation: Option<&str>) -> Self {
        Self {
            role: role.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            isolation: isolation.map(String::from),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SkeinError::Invocation {
                role: self.role.clone(),
                message: format!("failed to start session worker: {}", e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| SkeinError::Invocation {
            role: self.role.clone(),
            message: "session worker has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SkeinError::Invocation {
            role: self.role.clone(),
            message: "session worker has no stdout".into(),
        })?;

        debug!(role = %self.role, command = %self.command, "Session worker started");
        Ok(Worker {
            child,
            stdin,
            lines: FramedRead::new(stdout, LinesCodec::new()),
        })
    }

    fn decode(&self, line: &str) -> Result<Invocation> {
        let response: WireResponse =
            serde_json::from_str(line).map_err(|e| SkeinError::Malformed {
                role: self.role.clone(),
                message: format!("{} (line: {})", e, line),
            })?;

        if !response.ok {
            return Err(match response.kind.as_str() {
                "unknown_session" | "session_expired" => SkeinError::SessionResume {
                    role: self.role.clone(),
                    message: response.error,
                },
                _ => SkeinError::Invocation {
                    role: self.role.clone(),
                    message: response.error,
                },
            });
        }

        Ok(Invocation {
            output: response.output,
            session: ProviderSession::new(response.session, ProviderKind::Session),
            cost: response.cost,
        })
    }
}

impl ProviderAdapter for SessionAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Session
    }

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, Result<Invocation>> {
        Box::pin(async move {
            let mut guard = self.worker.lock().await;
            if guard.is_none() {
                *guard = Some(self.spawn_worker()?);
            }
            let worker = guard.as_mut().ok_or_else(|| SkeinError::Invocation {
                role: self.role.clone(),
                message: "session worker unavailable".into(),
            })?;

            let wire = WireRequest {
                task: &request.task,
                session: request.session.as_ref().map(|s| s.id.as_str()),
                workspace: self.isolation.as_deref(),
            };
            let mut line = serde_json::to_string(&wire)?;
            line.push('\n');

            let exchange = async {
                worker.stdin.write_all(line.as_bytes()).await?;
                worker.stdin.flush().await?;
                Ok::<_, std::io::Error>(worker.lines.next().await)
            };

            match tokio::time::timeout(request.timeout, exchange).await {
                Err(_) => {
                    // Tear the worker down so the next call respawns it.
                    if let Some(mut dead) = guard.take() {
                        let _ = dead.child.start_kill();
                    }
                    warn!(role = %self.role, "Session worker timed out, killed");
                    Err(SkeinError::InvocationTimeout {
                        role: self.role.clone(),
                        timeout_secs: request.timeout.as_secs(),
                    })
                }
                Ok(Err(e)) => {
                    if let Some(mut dead) = guard.take() {
                        let _ = dead.child.start_kill();
                    }
                    Err(SkeinError::Invocation {
                        role: self.role.clone(),
                        message: format!("session worker I/O failed: {}", e),
                    })
                }
                Ok(Ok(None)) => {
                    guard.take();
                    Err(SkeinError::Invocation {
                        role: self.role.clone(),
                        message: "session worker exited".into(),
                    })
                }
                Ok(Ok(Some(Err(e)))) => {
                    guard.take();
                    Err(SkeinError::Invocation {
                        role: self.role.clone(),
                        message: format!("session worker framing error: {}", e),
                    })
                }
                Ok(Ok(Some(Ok(line)))) => self.decode(&line),
            }
        })
    }
}
