//! Error types for the candidate store, run store and retrieval service.

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
