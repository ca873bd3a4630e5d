//! Error types for the Program Executor, REPL and Three-Round Orchestrator.

#[derive(Debug, thiserror::Error, Clone)]
pub enum ExecutorError {
    #[error("program parse failed: {0}")]
    ProgramParseFailed(String),

    #[error("limit exceeded: {limit}")]
    LimitExceeded { limit: String },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("empty_query_not_allowed")]
    EmptyQueryNotAllowed,

    #[error("round1 (plan) failed: {0}")]
    Round1Failed(String),

    #[error("round2 (examine) failed: {0}")]
    Round2Failed(String),

    #[error("round3 (decision) failed: {0}")]
    Round3Failed(String),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] rlm_core::error::RetrievalError),

    #[error("run store error: {0}")]
    RunStore(#[from] rlm_core::error::RunStoreError),
}
