use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Schema / catalog errors
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is already terminal and cannot be modified")]
    RunSealed(String),

    #[error("Node {node_id} already has a recorded result in run {run_id}")]
    DuplicateNodeResult { run_id: String, node_id: String },

    // Collaborator errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Generative transform failed: {0}")]
    Generative(String),

    #[error("Recipe store error: {0}")]
    Recipe(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;

/// Failure of a single agent invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationError {
    #[error("agent call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("agent returned malformed JSON: {0}")]
    MalformedBody(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Only timeouts and connection failures are worth a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(InvocationError::Timeout { after_ms: 30_000 }.is_transient());
        assert!(InvocationError::Connection("reset by peer".into()).is_transient());
        assert!(!InvocationError::Status {
            status: 500,
            body: "boom".into()
        }
        .is_transient());
        assert!(!InvocationError::MalformedBody("eof".into()).is_transient());
        assert!(!InvocationError::Cancelled.is_transient());
    }
}
