use thiserror::Error;

#[derive(Debug, Error)]
pub enum PynchyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy denied {tool}: {reason}")]
    PolicyDenied { tool: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Channel error ({channel}): {reason}")]
    Channel { channel: String, reason: String },

    #[error("Container error: {0}")]
    Container(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Malformed IPC payload: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PynchyError {
    /// Short error code string used in structured logs and IPC error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            PynchyError::Config(_) => "CONFIG_ERROR",
            PynchyError::PolicyDenied { .. } => "POLICY_DENIED",
            PynchyError::Database(_) => "DATABASE_ERROR",
            PynchyError::Channel { .. } => "CHANNEL_ERROR",
            PynchyError::Container(_) => "CONTAINER_ERROR",
            PynchyError::Git(_) => "GIT_ERROR",
            PynchyError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            PynchyError::Schema(_) => "SCHEMA_ERROR",
            PynchyError::Serialization(_) => "SERIALIZATION_ERROR",
            PynchyError::Io(_) => "IO_ERROR",
            PynchyError::Timeout { .. } => "TIMEOUT",
            PynchyError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error class is worth retrying with backoff.
    ///
    /// Policy denials and schema violations are terminal for the request;
    /// I/O, channel, and container failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PynchyError::Io(_)
                | PynchyError::Channel { .. }
                | PynchyError::Container(_)
                | PynchyError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PynchyError>;
