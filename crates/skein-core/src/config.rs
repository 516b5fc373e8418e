use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};
use crate::types::{AgentSpec, BackendKind};

/// Top-level Skein configuration.
///
/// This is the typed result of the configuration file; nothing outside this
/// module reads raw TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Per-environment feature flags, passed through to callers untouched.
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow definition file.
    #[serde(default = "default_workflow_path")]
    pub path: PathBuf,
    /// Watch the definition file and hot-reload between executions.
    #[serde(default)]
    pub watch: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            path: default_workflow_path(),
            watch: false,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_workflow_path() -> PathBuf {
    PathBuf::from("workflow.toml")
}

fn default_poll_interval() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    /// SQLite file for the embedded store (also the degraded fallback).
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    /// Postgres connection string, required when kind = "shared".
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            path: default_state_path(),
            url: None,
            retry: RetryConfig::default(),
        }
    }
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Embedded
}

fn default_state_path() -> PathBuf {
    PathBuf::from("skein.db")
}

/// Connection retry policy for the shared backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff in seconds; doubles after each failed attempt.
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    1
}

/// Connection settings for the three adapter variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub cli: CliProviderConfig,
    #[serde(default)]
    pub session: SessionProviderConfig,
    #[serde(default)]
    pub http: HttpProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    #[serde(default = "default_cli_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for CliProviderConfig {
    fn default() -> Self {
        Self {
            command: default_cli_command(),
            args: vec![],
        }
    }
}

fn default_cli_command() -> String {
    "agent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProviderConfig {
    #[serde(default = "default_cli_command")]
    pub command: String,
    #[serde(default = "default_session_args")]
    pub args: Vec<String>,
}

impl Default for SessionProviderConfig {
    fn default() -> Self {
        Self {
            command: default_cli_command(),
            args: default_session_args(),
        }
    }
}

fn default_session_args() -> Vec<String> {
    vec!["serve".to_string(), "--stdio".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    #[serde(default = "default_http_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_http_endpoint(),
            api_key: None,
        }
    }
}

fn default_http_endpoint() -> String {
    "http://127.0.0.1:8700/v1/complete".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkeinError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| SkeinError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that must hold before any execution is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.backend.kind == BackendKind::Shared && self.backend.url.is_none() {
            return Err(SkeinError::Config(
                "backend.kind = \"shared\" requires backend.url".into(),
            ));
        }
        for spec in &self.agents {
            spec.insertion()?;
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
