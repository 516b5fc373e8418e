use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkeinError {
    // Config errors — fatal at load time, execution must not start
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("State backend unavailable: {0}")]
    Unavailable(String),

    #[error("Snapshot version conflict: thread {thread_id} at version {version}")]
    Conflict { thread_id: String, version: u64 },

    // Provider errors
    #[error("Provider invocation failed: {role}: {message}")]
    Invocation { role: String, message: String },

    #[error("Provider timeout after {timeout_secs}s: {role}")]
    InvocationTimeout { role: String, timeout_secs: u64 },

    #[error("Malformed provider response: {role}: {message}")]
    Malformed { role: String, message: String },

    #[error("Session resume rejected: {role}: {message}")]
    SessionResume { role: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SkeinError {
    /// Short machine-readable tag for structured reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::ConfigNotFound(_) => "configuration_error",
            Self::Database(_) => "database_error",
            Self::Unavailable(_) => "backend_unreachable",
            Self::Conflict { .. } => "conflict",
            Self::Invocation { .. } => "invocation_failure",
            Self::InvocationTimeout { .. } => "timeout",
            Self::Malformed { .. } => "malformed_response",
            Self::SessionResume { .. } => "session_resume_failure",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SkeinError>;
