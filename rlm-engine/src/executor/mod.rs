//! Program Executor (C5, §4.5): bounded interpreter over program steps.

pub mod glimpse;
pub mod limits;
pub mod program;
pub mod repl;

use std::future::Future;
use std::pin::Pin;

use rlm_cache::{glimpse_id, CachedGlimpse, GlimpseCache};
use rlm_core::candidate_store::CandidateStore;
use rlm_core::models::CandidateIndex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::ExecutorError;
use crate::executor::glimpse::{deterministic_fallback, extract_grep, extract_head, extract_range};
use crate::executor::limits::ExecutionLimits;
use crate::executor::program::check_limits;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub events: Vec<Value>,
    pub glimpses: Vec<Value>,
    pub subcalls: Vec<Value>,
    pub variables: Value,
    pub status: String,
    pub meta: Value,
}

struct ExecState {
    run_id: String,
    events: Vec<Value>,
    glimpses: Vec<Value>,
    subcalls: Vec<Value>,
    variables: Map<String, Value>,
    selected_ids: Vec<String>,
    error_count: i64,
    step_seq: i64,
    stop_reason: Option<&'static str>,
}

pub struct ProgramExecutor<'a> {
    store: &'a CandidateStore,
    cache: &'a GlimpseCache,
}

impl<'a> ProgramExecutor<'a> {
    pub fn new(store: &'a CandidateStore, cache: &'a GlimpseCache) -> Self {
        Self { store, cache }
    }

    /// Runs the full bounded interpreter (§4.5). Pre-execution checks raise
    /// before any state is produced; per-step failures are recorded as
    /// events and counted against `max_event_errors`.
    pub async fn execute(
        &self,
        program: &Value,
        index: &CandidateIndex,
        run_id: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, ExecutorError> {
        check_limits(program, limits)?;

        let steps = program.get("steps").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        let mut state = ExecState {
            run_id: run_id.to_string(),
            events: Vec::new(),
            glimpses: Vec::new(),
            subcalls: Vec::new(),
            variables: Map::new(),
            selected_ids: Vec::new(),
            error_count: 0,
            step_seq: 0,
            stop_reason: None,
        };

        self.run_steps(&steps, index, limits, 1, &mut state).await?;

        state.variables.insert("selected_ids".to_string(), json!(state.selected_ids));

        let status = match state.stop_reason {
            Some("event_error_threshold") => "degraded",
            Some(_) => "stopped",
            None => "ok",
        };

        Ok(ExecutionResult {
            events: state.events,
            glimpses: state.glimpses,
            subcalls: state.subcalls,
            variables: Value::Object(state.variables),
            status: status.to_string(),
            meta: json!({"limits": limits.snapshot()}),
        })
    }

    fn run_steps<'f>(
        &'f self,
        steps: &'f [Value],
        index: &'f CandidateIndex,
        limits: &'f ExecutionLimits,
        depth: i64,
        state: &'f mut ExecState,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExecutorError>> + Send + 'f>> {
        Box::pin(async move {
            for step in steps {
                if state.stop_reason.is_some() {
                    return Ok(());
                }

                state.step_seq += 1;
                let step_no = state.step_seq;
                let action = step.get("action").and_then(|v| v.as_str()).unwrap_or("noop");

                let outcome = self.run_step(step, action, index, limits, state).await;

                match outcome {
                    Ok(Some(payload)) => {
                        state.events.push(json!({"step": step_no, "action": action, "status": "ok", "payload": payload}));
                    }
                    Ok(None) => {
                        state.events.push(json!({"step": step_no, "action": action, "status": "ok"}));
                    }
                    Err(msg) => {
                        state.events.push(json!({"step": step_no, "action": action, "status": "error", "error": msg}));
                        state.error_count += 1;
                        if state.error_count > limits.max_event_errors {
                            state.events.push(json!({"step": step_no, "action": "event_error_threshold", "status": "error"}));
                            state.stop_reason = Some("event_error_threshold");
                            return Ok(());
                        }
                    }
                }

                if let Some(subcalls) = step.get("subcalls").and_then(|v| v.as_array()) {
                    if !subcalls.is_empty() {
                        let recorded: Vec<Value> = subcalls.clone();
                        state.subcalls.extend(recorded);
                        self.run_steps(subcalls, index, limits, depth + 1, state).await?;
                    }
                }
            }
            Ok(())
        })
    }

    async fn run_step(
        &self,
        step: &Value,
        action: &str,
        index: &CandidateIndex,
        limits: &ExecutionLimits,
        state: &mut ExecState,
    ) -> Result<Option<Value>, String> {
        match action {
            "noop" => Ok(None),
            "select" => self.run_select(step, state),
            "glimpse" => self.run_glimpse(step, index, limits, state).await,
            "repl" => Err("repl_env_unavailable".to_string()),
            other => Err(format!("unrecognized action `{other}`")),
        }
    }

    fn run_select(&self, step: &Value, state: &mut ExecState) -> Result<Option<Value>, String> {
        let ids = step
            .get("selected_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| "selected_ids must be a list of non-empty strings".to_string())?;

        for id in ids {
            let id = id
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| "selected_ids must be a list of non-empty strings".to_string())?;
            if !state.selected_ids.iter().any(|existing| existing == id) {
                state.selected_ids.push(id.to_string());
            }
        }
        Ok(Some(json!({"selected_ids": state.selected_ids})))
    }

    async fn run_glimpse(
        &self,
        step: &Value,
        index: &CandidateIndex,
        limits: &ExecutionLimits,
        state: &mut ExecState,
    ) -> Result<Option<Value>, String> {
        let artifact_id = step
            .get("artifact_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "artifact_id required".to_string())?;
        let mode = step.get("mode").and_then(|v| v.as_str()).unwrap_or("head");

        let (text, content_hash) = self.fetch_artifact_text(artifact_id, index).await;

        let extracted = match mode {
            "head" => {
                let n = step.get("n").and_then(|v| v.as_i64()).unwrap_or(800);
                extract_head(&text, n, limits.max_glimpse_chars)
            }
            "range" => {
                let start = step.get("start").and_then(|v| v.as_i64()).unwrap_or(0);
                let end = step.get("end").and_then(|v| v.as_i64()).unwrap_or(0);
                extract_range(&text, start, end)
            }
            "grep" => {
                let pattern = step.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                let window = step.get("window").and_then(|v| v.as_i64()).unwrap_or(40);
                let max_hits = step
                    .get("max_hits")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(limits.max_grep_hits)
                    .min(limits.max_grep_hits);
                extract_grep(&text, pattern, window, max_hits)
            }
            other => return Err(format!("unrecognized glimpse mode `{other}`")),
        };

        if extracted.text.is_empty() {
            return Err("glimpse extracted empty text".to_string());
        }

        let hash: String = {
            let digest = Sha256::digest(extracted.text.as_bytes());
            digest.iter().map(|b| format!("{b:02x}")).collect()
        };

        let glimpse_key_spec = json!({"mode": mode, "step": step});
        let gid = glimpse_id(artifact_id, &content_hash, &glimpse_key_spec);
        self.cache
            .set(
                &state.run_id,
                &gid,
                &CachedGlimpse { meta: json!({"artifact_id": artifact_id, "mode": mode}), text: extracted.text.clone() },
                86_400,
            )
            .await;

        let record = json!({
            "artifact_id": artifact_id,
            "mode": mode,
            "text": extracted.text,
            "span": extracted.span,
            "hash": hash,
            "glimpse_meta": {
                "step": state.step_seq,
                "source": "executor",
                "artifact_id": artifact_id,
                "content_hash": content_hash,
            }
        });
        state.glimpses.push(record.clone());
        Ok(Some(record))
    }

    async fn fetch_artifact_text(&self, artifact_id: &str, index: &CandidateIndex) -> (String, String) {
        if let Ok(content) = self.store.get_content(artifact_id).await {
            return (content.content, content.content_hash);
        }
        let preview = index
            .candidates
            .iter()
            .find(|c| c.artifact_id == artifact_id)
            .map(|c| (c.content_preview.clone(), c.content_hash.clone()))
            .unwrap_or_default();
        preview
    }
}

/// Outcome mapping for the assembly runner (§4.5, §4.6a): the caller passes
/// in a `fallback_top_k` used only when the program fails to parse or hits
/// the error threshold.
pub fn map_outcome(
    result: Result<ExecutionResult, ExecutorError>,
    index: &CandidateIndex,
    fallback_top_k: i64,
) -> (String, Value, Vec<Value>) {
    match result {
        Ok(execution) if execution.status == "ok" => {
            let selected_ids = execution.variables.get("selected_ids").cloned().unwrap_or(json!([]));
            (
                "ok".to_string(),
                json!({"mode": "program", "selected_ids": dedup_ids(&selected_ids)}),
                execution.events,
            )
        }
        Ok(execution) if execution.status == "degraded" => {
            ("degraded".to_string(), deterministic_fallback(index, fallback_top_k), execution.events)
        }
        Ok(execution) => ("stopped".to_string(), json!({}), execution.events),
        Err(ExecutorError::ProgramParseFailed(_)) => {
            ("degraded".to_string(), deterministic_fallback(index, fallback_top_k), Vec::new())
        }
        Err(ExecutorError::LimitExceeded { limit }) => (
            "stopped".to_string(),
            json!({}),
            vec![json!({"type": "limit_exceeded", "limit": limit})],
        ),
    }
}

fn dedup_ids(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(arr) = value.as_array() {
        for v in arr {
            if let Some(s) = v.as_str() {
                if !out.iter().any(|e: &String| e == s) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::models::{Candidate, ScoreBreakdown};
    use sqlx::sqlite::SqlitePool;

    fn sample_index() -> CandidateIndex {
        CandidateIndex {
            session_id: "s1".into(),
            project_id: "p1".into(),
            query: "q".into(),
            candidates: vec![Candidate {
                artifact_id: "a1".into(),
                scope: "session".into(),
                kind: "note".into(),
                title: None,
                content_hash: "h1".into(),
                pinned: false,
                weight: 1.0,
                source: "manual".into(),
                content_preview: "hello world, this is a note about the session".into(),
                token_estimate: None,
                base_score: 1.0,
                score_breakdown: ScoreBreakdown { weight: 1.0, hit_count: 0.0, pinned_bonus: 0.0 },
            }],
        }
    }

    async fn empty_store() -> CandidateStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE artifacts (id TEXT PRIMARY KEY, content TEXT, content_hash TEXT, metadata TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        CandidateStore::new(pool)
    }

    #[tokio::test]
    async fn select_then_glimpse_produces_two_ok_events() {
        let store = empty_store().await;
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let executor = ProgramExecutor::new(&store, &cache);
        let index = sample_index();
        let program = json!({"steps": [
            {"action": "select", "selected_ids": ["a1"]},
            {"action": "glimpse", "artifact_id": "a1", "mode": "head", "n": 800},
        ]});

        let result = executor.execute(&program, &index, "run-1", &ExecutionLimits::default()).await.unwrap();
        assert_eq!(result.status, "ok");
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.glimpses.len(), 1);
    }

    #[tokio::test]
    async fn repl_action_is_recorded_as_an_error_event() {
        let store = empty_store().await;
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let executor = ProgramExecutor::new(&store, &cache);
        let index = sample_index();
        let program = json!({"steps": [{"action": "repl", "code": "1+1", "timeout_s": 1}]});

        let result = executor.execute(&program, &index, "run-1", &ExecutionLimits::default()).await.unwrap();
        assert_eq!(result.events[0]["status"], "error");
    }

    #[tokio::test]
    async fn error_threshold_degrades_the_run() {
        let store = empty_store().await;
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let executor = ProgramExecutor::new(&store, &cache);
        let index = sample_index();
        let mut limits = ExecutionLimits::default();
        limits.max_event_errors = 1;
        let program = json!({"steps": [
            {"action": "glimpse", "artifact_id": "missing", "mode": "range", "start": 0, "end": 0},
            {"action": "glimpse", "artifact_id": "missing", "mode": "range", "start": 0, "end": 0},
            {"action": "glimpse", "artifact_id": "missing", "mode": "range", "start": 0, "end": 0},
        ]});

        let result = executor.execute(&program, &index, "run-1", &limits).await.unwrap();
        assert_eq!(result.status, "degraded");
    }

    #[test]
    fn parse_failure_maps_to_degraded_fallback() {
        let index = sample_index();
        let (status, context, _events) =
            map_outcome(Err(ExecutorError::ProgramParseFailed("x".into())), &index, 20);
        assert_eq!(status, "degraded");
        assert_eq!(context["mode"], "fallback");
    }

    #[test]
    fn limit_exceeded_maps_to_stopped_with_empty_context() {
        let index = sample_index();
        let (status, context, errors) =
            map_outcome(Err(ExecutorError::LimitExceeded { limit: "max_steps".into() }), &index, 20);
        assert_eq!(status, "stopped");
        assert_eq!(context, json!({}));
        assert_eq!(errors[0]["limit"], "max_steps");
    }
}
