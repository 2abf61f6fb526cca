// ABOUTME: Error taxonomy for clone and schema-export runs
// ABOUTME: Each variant carries enough context for the user to act on it

use thiserror::Error;

use crate::models::Stage;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected before any process spawns (same source and destination, unknown profile).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another clone or schema export already owns the run slot.
    #[error("Another operation is already running. Wait for it to finish or cancel it first")]
    Busy,

    #[error("{tool} not found. Please install PostgreSQL client tools")]
    ToolNotFound { tool: String },

    #[error("Failed to start {tool}: {reason}")]
    SpawnFailed { tool: String, reason: String },

    #[error("{tool} failed during {stage} ({}): {stderr_tail}", exit_description(*.exit_code))]
    ProcessFailed {
        stage: Stage,
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Catalog query failed: {0}")]
    Catalog(String),

    /// Non-fatal; only ever surfaced as a warning log line.
    #[error("Verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A run task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
