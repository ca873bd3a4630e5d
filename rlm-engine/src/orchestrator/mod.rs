//! Three-Round Orchestrator (C6, §4.6): R0(setup) -> R1(Plan) -> R2(Examine)
//! -> R3(Decision) -> TERMINAL.

use rlm_cache::GlimpseCache;
use rlm_core::candidate_store::CandidateStore;
use rlm_core::config::VllmConfig;
use rlm_core::error::RetrievalError;
use rlm_core::models::{CandidateIndex, RetrievalOptions, RunPayloadUpdate, RunStatus};
use rlm_core::retrieval::RetrievalService;
use rlm_core::run_store::RunStore;
use serde_json::{json, Value};

use crate::error::OrchestratorError;
use crate::executor::limits::ExecutionLimits;
use crate::executor::{map_outcome, ProgramExecutor};
use crate::rootlm::{select_decision_backend, BackendSelection, MockAdapter, RootLmAdapter};
use crate::trace::{preview_120, TraceLogger};

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: String,
    pub program: Value,
    pub glimpses: Vec<Value>,
    pub subcalls: Vec<Value>,
    pub final_answer: Option<String>,
    pub citations: Vec<Value>,
    pub final_payload: Value,
}

pub struct Orchestrator<'a> {
    store: &'a CandidateStore,
    run_store: &'a RunStore,
    cache: &'a GlimpseCache,
    vllm: &'a VllmConfig,
    trace: &'a TraceLogger,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a CandidateStore,
        run_store: &'a RunStore,
        cache: &'a GlimpseCache,
        vllm: &'a VllmConfig,
        trace: &'a TraceLogger,
    ) -> Self {
        Self { store, run_store, cache, vllm, trace }
    }

    pub async fn run(&self, session_id: &str, query: &str, options: Value) -> Result<RunResult, OrchestratorError> {
        if query.trim().is_empty() {
            return Err(OrchestratorError::EmptyQueryNotAllowed);
        }

        // R0: setup.
        let retrieval_options = retrieval_options_from(&options);
        let retrieval = RetrievalService::new(self.store);
        let index = match retrieval.build_candidate_index(session_id, query, retrieval_options).await {
            Ok(index) => index,
            Err(RetrievalError::SessionNotFound(id)) => return Err(OrchestratorError::SessionNotFound(id)),
            Err(other) => return Err(other.into()),
        };

        let index_json = serde_json::to_value(&index).unwrap_or(json!({}));
        let run_id = self.run_store.insert_run(session_id, query, &options, &index_json).await?;

        let plan_backend = MockAdapter;
        let requested_backend = options.get("rootlm_backend").and_then(|v| v.as_str()).unwrap_or(self.vllm_default());
        let (decision_backend, mut fallback_reason) = select_decision_backend(requested_backend, self.vllm);

        let limits = ExecutionLimits::from_overrides(
            &ExecutionLimits::default(),
            options.get("limits").unwrap_or(&Value::Null),
        );

        // R1: plan.
        let policy = json!({"stage": "plan"});
        let program_result = match plan_backend.generate_program(&index, &policy, &limits.snapshot(), &options).await
        {
            Ok(result) => result,
            Err(err) => {
                return self.finish_with_round_error(&run_id, &index_json, "round1", &err.to_string()).await;
            }
        };

        let meta_round1 = json!({
            "backend": program_result.meta.get("backend").cloned().unwrap_or(json!("mock")),
            "parsed": program_result.meta.get("parsed").cloned().unwrap_or(json!(true)),
            "policy": policy,
            "limits": limits.snapshot(),
            "stage": "plan",
        });
        self.trace.emit(&run_id, "plan", &program_result.program, &meta_round1).ok();

        self.persist(
            &run_id,
            RunPayloadUpdate {
                program: program_result.program.clone(),
                meta: json!({"round1": meta_round1}),
                status: RunStatus::Ok,
                ..Default::default()
            },
        )
        .await?;

        // R2: examine.
        let executor = ProgramExecutor::new(self.store, self.cache);
        let execution = executor.execute(&program_result.program, &index, &run_id, &limits).await;

        let (status, assembled_context, events) = map_outcome(execution, &index, 20);
        let glimpses = self.glimpses_from_events(&events);
        let glimpses_meta: Vec<Value> = glimpses
            .iter()
            .map(|g| g.get("glimpse_meta").cloned().unwrap_or(json!({})))
            .collect();
        let subcalls: Vec<Value> = Vec::new();
        let evidence = json!([{"events": events}, {"glimpses": glimpses}, {"subcalls": subcalls}]);

        self.trace
            .emit(
                &run_id,
                "examine",
                &json!({}),
                &json!({
                    "events_count": events.len(),
                    "glimpses_count": glimpses.len(),
                    "subcalls_count": subcalls.len(),
                    "executor_status": status,
                }),
            )
            .ok();

        self.persist(
            &run_id,
            RunPayloadUpdate {
                program: program_result.program.clone(),
                meta: json!({"round1": meta_round1, "assembled_context": assembled_context}),
                events: events.clone(),
                glimpses: glimpses.clone(),
                glimpses_meta,
                subcalls: subcalls.clone(),
                status: RunStatus::Ok,
                ..Default::default()
            },
        )
        .await?;

        let glimpses_for_result = glimpses.clone();
        let subcalls_for_result = subcalls.clone();

        // R3: decision.
        let (final_result, meta_round3_extra) = self
            .generate_final_with_fallback(decision_backend, &index, &evidence, &json!(subcalls), &options, &mut fallback_reason)
            .await?;

        let final_answer = final_result
            .final_payload
            .get("answer")
            .map(value_as_display_string)
            .filter(|s| !s.is_empty());
        let citations: Vec<Value> = final_result
            .final_payload
            .get("citations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let meta_round3 = json!({
            "backend": final_result.meta.get("backend").cloned().unwrap_or(json!("mock")),
            "parsed": final_result.meta.get("parsed").cloned().unwrap_or(json!(true)),
            "evidence_items": evidence.as_array().map(|a| a.len()).unwrap_or(0),
            "stage": "decision",
            "fallback_reason": fallback_reason,
            "fallback_from": meta_round3_extra,
        });

        self.trace
            .emit(
                &run_id,
                "decision",
                &final_result.final_payload,
                &json!({
                    "citations_count": citations.len(),
                    "final_answer_preview": preview_120(final_answer.as_deref().unwrap_or("")),
                }),
            )
            .ok();

        self.persist(
            &run_id,
            RunPayloadUpdate {
                program: program_result.program.clone(),
                meta: json!({"round1": meta_round1, "assembled_context": assembled_context, "round3": meta_round3}),
                events,
                glimpses,
                glimpses_meta: Vec::new(),
                subcalls,
                final_payload: final_result.final_payload.clone(),
                final_answer: final_answer.clone(),
                citations: citations.clone(),
                status: RunStatus::Ok,
                ..Default::default()
            },
        )
        .await?;

        Ok(RunResult {
            run_id,
            status,
            program: program_result.program,
            glimpses: glimpses_for_result,
            subcalls: subcalls_for_result,
            final_answer,
            citations,
            final_payload: final_result.final_payload,
        })
    }

    fn vllm_default(&self) -> &'static str {
        if self.vllm.is_usable() {
            "vllm"
        } else {
            "mock"
        }
    }

    fn glimpses_from_events(&self, events: &[Value]) -> Vec<Value> {
        events
            .iter()
            .filter(|e| e.get("action").and_then(|v| v.as_str()) == Some("glimpse"))
            .filter_map(|e| e.get("payload").cloned())
            .collect()
    }

    async fn generate_final_with_fallback(
        &self,
        decision_backend: BackendSelection,
        index: &CandidateIndex,
        evidence: &Value,
        subcalls: &Value,
        options: &Value,
        fallback_reason: &mut Option<String>,
    ) -> Result<(crate::rootlm::FinalResult, Option<String>), OrchestratorError> {
        match decision_backend {
            BackendSelection::Mock => {
                let result = MockAdapter
                    .generate_final(index, evidence, subcalls, options)
                    .await
                    .map_err(|e| OrchestratorError::Round3Failed(e.to_string()))?;
                Ok((result, None))
            }
            BackendSelection::HttpChat(adapter) => {
                match adapter.generate_final(index, evidence, subcalls, options).await {
                    Ok(result) => Ok((result, None)),
                    Err(err) => {
                        *fallback_reason = Some(format!("vllm_request_failed:{err}"));
                        let result = MockAdapter
                            .generate_final(index, evidence, subcalls, options)
                            .await
                            .map_err(|e| OrchestratorError::Round3Failed(e.to_string()))?;
                        Ok((result, Some("vllm".to_string())))
                    }
                }
            }
        }
    }

    async fn finish_with_round_error(
        &self,
        run_id: &str,
        _index_json: &Value,
        stage: &str,
        error: &str,
    ) -> Result<RunResult, OrchestratorError> {
        self.trace.emit(run_id, "error", &json!({"error": error}), &json!({"stage": stage})).ok();
        self.persist(
            run_id,
            RunPayloadUpdate {
                status: RunStatus::Error,
                errors: vec![json!({"stage": stage, "error": error})],
                ..Default::default()
            },
        )
        .await?;
        Err(match stage {
            "round1" => OrchestratorError::Round1Failed(error.to_string()),
            "round2" => OrchestratorError::Round2Failed(error.to_string()),
            _ => OrchestratorError::Round3Failed(error.to_string()),
        })
    }

    async fn persist(&self, run_id: &str, update: RunPayloadUpdate) -> Result<(), OrchestratorError> {
        self.run_store.update_run_payload(run_id, &update).await?;
        Ok(())
    }
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

fn value_as_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePool;
    use tempfile::tempdir;

    async fn seeded_pool() -> SqlitePool {
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
        pool
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_touching_storage() {
        let pool = seeded_pool().await;
        let store = CandidateStore::new(pool);
        let run_store = RunStore::new(SqlitePool::connect(":memory:").await.unwrap());
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let vllm = VllmConfig::default();
        let dir = tempdir().unwrap();
        let trace = TraceLogger::new(dir.path());

        let orchestrator = Orchestrator::new(&store, &run_store, &cache, &vllm, &trace);
        let err = orchestrator.run("s1", "   ", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyQueryNotAllowed));
    }

    #[tokio::test]
    async fn unknown_session_surfaces_as_session_not_found() {
        let pool = seeded_pool().await;
        let store = CandidateStore::new(pool.clone());
        let run_store = RunStore::new(pool);
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let vllm = VllmConfig::default();
        let dir = tempdir().unwrap();
        let trace = TraceLogger::new(dir.path());

        let orchestrator = Orchestrator::new(&store, &run_store, &cache, &vllm, &trace);
        let err = orchestrator.run("missing", "hello", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn mock_run_completes_with_a_final_answer_and_trace_lines() {
        let pool = seeded_pool().await;
        let store = CandidateStore::new(pool.clone());
        let run_store = RunStore::new(pool);
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let vllm = VllmConfig::default();
        let dir = tempdir().unwrap();
        let trace = TraceLogger::new(dir.path());

        let orchestrator = Orchestrator::new(&store, &run_store, &cache, &vllm, &trace);
        let result = orchestrator.run("s1", "hello", json!({})).await.unwrap();

        assert!(result.final_answer.is_some());
        let lines = trace.replay(&result.run_id).unwrap();
        assert_eq!(lines.len(), 3);

        let run = run_store.get_run(&result.run_id).await.unwrap();
        assert!(matches!(run.status, RunStatus::Ok));
    }
}
