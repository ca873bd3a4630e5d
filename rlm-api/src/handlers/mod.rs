//! Request handlers for the RLM HTTP surface (§6.1).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use rlm_cache::GlimpseCache;
use rlm_core::candidate_store::CandidateStore;
use rlm_core::config::{RlmConfig, VllmConfig};
use rlm_core::error::RetrievalError;
use rlm_core::models::{RetrievalOptions, RunPatch};
use rlm_core::retrieval::RetrievalService;
use rlm_core::run_store::RunStore;
use rlm_engine::executor::limits::ExecutionLimits;
use rlm_engine::executor::{map_outcome, ProgramExecutor};
use rlm_engine::rootlm::{MockAdapter, RootLmAdapter};
use rlm_engine::trace::TraceLogger;
use rlm_engine::Orchestrator;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePool;

use crate::error::ApiError;

/// Shared, request-cloneable state for every handler. `pool`, `cache`, and
/// the other fields are all cheap to clone (internally `Arc`-backed), so
/// constructing `CandidateStore`/`RunStore` fresh per request stays
/// inexpensive, mirroring the backend-selection pattern in
/// `rlm_engine::rootlm` (§9: "constructed per request, no global registry").
pub struct ApiState {
    pub pool: SqlitePool,
    pub cache: GlimpseCache,
    pub vllm: VllmConfig,
    pub trace: TraceLogger,
    pub config: RlmConfig,
}

#[derive(Debug, Deserialize)]
pub struct RlmRequest {
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub options: Value,
}

/// `GET /health` (§6.1): ambient liveness probe, not part of C1-C8. Pings
/// the SQL pool on every call; Redis degrades gracefully by design (§9), so
/// there is nothing further worth gating on here.
pub async fn health_check(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(err) => (StatusCode::OK, Json(json!({"status": "degraded", "detail": err.to_string()}))),
    }
}

/// `POST /v1/rlm/assemble` (§4.6a): runs the Program Executor directly,
/// bypassing the three-round orchestrator.
pub async fn assemble(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RlmRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.query.trim().is_empty() {
        return Err(ApiError::EmptyQuery);
    }

    let store = CandidateStore::new(state.pool.clone());
    let run_store = RunStore::new(state.pool.clone());

    let retrieval = RetrievalService::new(&store);
    let index = match retrieval
        .build_candidate_index(&req.session_id, &req.query, retrieval_options_from(&req.options))
        .await
    {
        Ok(index) => index,
        Err(RetrievalError::SessionNotFound(id)) => return Err(ApiError::SessionNotFound(id)),
        Err(other) => return Err(ApiError::Retrieval(other)),
    };
    let index_json = serde_json::to_value(&index).unwrap_or(json!({}));

    let run_id = run_store
        .insert_run(&req.session_id, &req.query, &req.options, &index_json)
        .await
        .map_err(|e| ApiError::Orchestrator(rlm_engine::OrchestratorError::RunStore(e)))?;

    let limits = ExecutionLimits::from_overrides(
        &ExecutionLimits::assembly_default(),
        req.options.get("limits").unwrap_or(&Value::Null),
    );

    let program = match req.options.get("program") {
        Some(override_program) => override_program.clone(),
        None => MockAdapter
            .generate_program(&index, &json!({"stage": "assemble"}), &limits.snapshot(), &req.options)
            .await
            .map(|r| r.program)
            .unwrap_or(json!({"steps": []})),
    };

    let executor = ProgramExecutor::new(&store, &state.cache);
    let execution = executor.execute(&program, &index, &run_id, &limits).await;
    let (status, assembled_context, events) = map_outcome(execution, &index, 20);

    state
        .trace
        .emit(
            &run_id,
            "examine",
            &assembled_context,
            &json!({"events_count": events.len(), "executor_status": status}),
        )
        .ok();

    run_store
        .update_run_patch(
            &run_id,
            &RunPatch {
                program: Some(program.clone()),
                events: Some(events),
                status: Some(status.clone()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ApiError::Orchestrator(rlm_engine::OrchestratorError::RunStore(e)))?;

    Ok(Json(json!({
        "run_id": run_id,
        "status": status,
        "assembled_context": assembled_context,
        "rounds_summary": [],
        "rendered_prompt": Value::Null,
    })))
}

/// `POST /v1/rlm/run` (§4.6): the full three-round orchestrator.
pub async fn run(State(state): State<Arc<ApiState>>, Json(req): Json<RlmRequest>) -> Result<Json<Value>, ApiError> {
    let store = CandidateStore::new(state.pool.clone());
    let run_store = RunStore::new(state.pool.clone());
    let orchestrator = Orchestrator::new(&store, &run_store, &state.cache, &state.vllm, &state.trace);

    let result = orchestrator.run(&req.session_id, &req.query, req.options).await?;

    Ok(Json(json!({
        "run_id": result.run_id,
        "status": result.status,
        "program": result.program,
        "glimpses": result.glimpses,
        "subcalls": result.subcalls,
        "final_answer": result.final_answer,
        "citations": result.citations,
        "final": result.final_payload,
    })))
}

fn retrieval_options_from(options: &Value) -> RetrievalOptions {
    let mut opts = RetrievalOptions::default();
    if let Some(v) = options.get("top_k").and_then(|v| v.as_i64()) {
        opts.top_k = v;
    }
    if let Some(v) = options.get("preview_chars").and_then(|v| v.as_i64()) {
        opts.preview_chars = v;
    }
    if let Some(v) = options.get("include_global").and_then(|v| v.as_bool()) {
        opts.include_global = v;
    }
    if let Some(arr) = options.get("allowed_types").and_then(|v| v.as_array()) {
        opts.allowed_types = arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn seeded_state() -> Arc<ApiState> {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query("CREATE TABLE sessions (id TEXT PRIMARY KEY, project_id TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE artifacts (
                id TEXT PRIMARY KEY, project_id TEXT NOT NULL, session_id TEXT,
                scope TEXT NOT NULL, type TEXT NOT NULL, title TEXT, content TEXT NOT NULL,
                content_hash TEXT NOT NULL, token_estimate INTEGER, metadata TEXT,
                weight REAL NOT NULL DEFAULT 1.0, pinned INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'manual', status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE rlm_runs (
                id TEXT PRIMARY KEY, session_id TEXT NOT NULL, query TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '{}', candidate_index TEXT NOT NULL DEFAULT '{}',
                program TEXT NOT NULL DEFAULT '{}', meta TEXT NOT NULL DEFAULT '{}',
                events TEXT NOT NULL DEFAULT '[]', glimpses TEXT NOT NULL DEFAULT '[]',
                glimpses_meta TEXT NOT NULL DEFAULT '[]', subcalls TEXT NOT NULL DEFAULT '[]',
                evidence TEXT NOT NULL DEFAULT '[]', final TEXT NOT NULL DEFAULT '{}',
                final_answer TEXT, citations TEXT NOT NULL DEFAULT '[]',
                assembled_context TEXT NOT NULL DEFAULT '{}', rendered_prompt TEXT,
                llm_raw TEXT NOT NULL DEFAULT '[]', errors TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'ok', created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE rlm_run_events (id INTEGER PRIMARY KEY AUTOINCREMENT, run_id TEXT NOT NULL, event TEXT NOT NULL, created_at TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO sessions (id, project_id) VALUES ('s1', 'p1')").execute(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO artifacts (id, project_id, session_id, scope, type, content, content_hash, weight, pinned, source, status, created_at, updated_at)
             VALUES ('a1', 'p1', NULL, 'project', 'note', 'hello world note body', 'h1', 1.0, 0, 'manual', 'active', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let dir = tempdir().unwrap();
        Arc::new(ApiState {
            pool,
            cache: GlimpseCache::new("redis://127.0.0.1:1").unwrap(),
            vllm: VllmConfig::default(),
            trace: TraceLogger::new(dir.into_path()),
            config: RlmConfig::default(),
        })
    }

    fn router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/v1/rlm/assemble", post(assemble))
            .route("/v1/rlm/run", post(run))
            .with_state(state)
    }

    #[tokio::test]
    async fn health_reports_ok_against_a_reachable_pool() {
        let app = router(seeded_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_happy_path_returns_a_mock_final_answer() {
        let app = router(seeded_state().await);
        let body = json!({"session_id": "s1", "query": "what is this session about?"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/rlm/run")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_with_empty_query_is_bad_request() {
        let app = router(seeded_state().await);
        let body = json!({"session_id": "s1", "query": "  "});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/rlm/run")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn assemble_with_unknown_session_is_not_found() {
        let app = router(seeded_state().await);
        let body = json!({"session_id": "missing", "query": "hello"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/rlm/assemble")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
