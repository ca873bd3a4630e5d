//! Maps component error enums to HTTP status codes and JSON bodies (§7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rlm_core::error::RetrievalError;
use rlm_engine::OrchestratorError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("empty_query_not_allowed")]
    EmptyQuery,

    #[error("session_not_found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    Retrieval(#[from] RetrievalError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::EmptyQuery => (StatusCode::BAD_REQUEST, "empty_query_not_allowed".to_string()),
            ApiError::SessionNotFound(id) => (StatusCode::NOT_FOUND, format!("session_not_found: {id}")),
            ApiError::Orchestrator(OrchestratorError::EmptyQueryNotAllowed) => {
                (StatusCode::BAD_REQUEST, "empty_query_not_allowed".to_string())
            }
            ApiError::Orchestrator(OrchestratorError::SessionNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("session_not_found: {id}"))
            }
            ApiError::Orchestrator(other) => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
            ApiError::Retrieval(RetrievalError::SessionNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("session_not_found: {id}"))
            }
            ApiError::Retrieval(other) => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        (status, Json(json!({"detail": detail}))).into_response()
    }
}
