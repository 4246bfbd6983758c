//! Error types for Recall

use thiserror::Error;

/// Result type alias for Recall operations
pub type Result<T> = std::result::Result<T, RecallError>;

/// Main error type for Recall
#[derive(Error, Debug)]
pub enum RecallError {
    /// Non-2xx response from the upstream LLM; surfaced with the original
    /// status and body so the gateway can pass it through verbatim.
    #[error("Upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Non-fatal; callers fall back to the char/4 estimate.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Summarization error: {0}")]
    Summarization(String),

    /// Per-file ingestion failure; logged and skipped so the watcher continues.
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// The LLM returned unparseable reconciliation output.
    #[error("Decision error: {0}")]
    Decision(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frontmatter error: {0}")]
    Frontmatter(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecallError {
    /// Check if the error is a transient transport fault worth retrying
    /// on the next turn.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecallError::Http(_) | RecallError::Upstream { .. } | RecallError::Store(_)
        )
    }

    /// HTTP status for the gateway's error body.
    pub fn status_code(&self) -> u16 {
        match self {
            RecallError::Upstream { status, .. } => *status,
            RecallError::InvalidInput(_) => 400,
            RecallError::Summarization(_) => 502,
            _ => 500,
        }
    }
}
