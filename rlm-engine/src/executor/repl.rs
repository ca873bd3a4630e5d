//! REPL Command Grammar (§4.5a): a forgiving, line-oriented command
//! language for driving the executor outside the three-round orchestrator.

use std::sync::OnceLock;

use regex::Regex;
use rlm_cache::GlimpseCache;
use rlm_core::candidate_store::CandidateStore;
use rlm_core::models::RetrievalOptions;
use rlm_core::retrieval::RetrievalService;
use rlm_core::run_store::RunStore;
use serde_json::{json, Map, Value};

use crate::executor::glimpse::{extract_grep_lines, extract_head, extract_range};
use crate::rootlm::adapter::RootLmAdapter;

#[derive(Debug, Clone)]
pub struct ReplLimits {
    pub max_steps: i64,
    pub max_glimpse_chars: i64,
    pub max_total_glimpse_chars: i64,
    pub max_subcalls: i64,
    pub max_depth: i64,
}

impl Default for ReplLimits {
    fn default() -> Self {
        Self {
            max_steps: 64,
            max_glimpse_chars: 2000,
            max_total_glimpse_chars: 20_000,
            max_subcalls: 4,
            max_depth: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplOutcome {
    pub events: Vec<Value>,
    pub glimpses: Vec<Value>,
    pub variables: Value,
    pub final_text: Option<String>,
}

struct ReplState {
    variables: Map<String, Value>,
    events: Vec<Value>,
    glimpses: Vec<Value>,
    last_glimpse_text: String,
    total_glimpse_chars: i64,
    subcall_count: i64,
    final_text: Option<String>,
    stopped: bool,
}

pub struct ReplExecutor<'a> {
    store: &'a CandidateStore,
    cache: &'a GlimpseCache,
    run_store: &'a RunStore,
    adapter: &'a dyn RootLmAdapter,
}

impl<'a> ReplExecutor<'a> {
    pub fn new(
        store: &'a CandidateStore,
        cache: &'a GlimpseCache,
        run_store: &'a RunStore,
        adapter: &'a dyn RootLmAdapter,
    ) -> Self {
        Self { store, cache, run_store, adapter }
    }

    /// Runs a REPL program end to end, never hard-failing on a single
    /// command's own error (§4.5a: "forgiving by design").
    pub async fn run(&self, text: &str, run_id: &str, limits: &ReplLimits) -> ReplOutcome {
        let mut state = ReplState {
            variables: Map::new(),
            events: Vec::new(),
            glimpses: Vec::new(),
            last_glimpse_text: String::new(),
            total_glimpse_chars: 0,
            subcall_count: 0,
            final_text: None,
            stopped: false,
        };

        let block = extract_fenced_block(text);
        let mut step_no = 0i64;

        for line in block.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            step_no += 1;
            if step_no > limits.max_steps {
                state.events.push(json!({"step": step_no, "action": "max_steps", "status": "error"}));
                break;
            }
            if state.stopped {
                break;
            }

            let Some((name, fields)) = parse_command_line(line) else {
                state.events.push(json!({"step": step_no, "status": "error", "error": "unparsable command line"}));
                continue;
            };

            let substituted: Map<String, String> =
                fields.into_iter().map(|(k, v)| (k, substitute_vars(&v, &state.variables))).collect();

            let outcome = self.run_command(&name, &substituted, run_id, limits, &mut state).await;
            match outcome {
                Ok(payload) => {
                    state.events.push(json!({"step": step_no, "action": name, "status": "ok", "payload": payload}));
                }
                Err(msg) => {
                    state.events.push(json!({"step": step_no, "action": name, "status": "error", "error": msg}));
                }
            }
        }

        ReplOutcome {
            events: state.events,
            glimpses: state.glimpses,
            variables: Value::Object(state.variables),
            final_text: state.final_text,
        }
    }

    async fn run_command(
        &self,
        name: &str,
        fields: &Map<String, String>,
        run_id: &str,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        match name {
            "LIST_ARTIFACTS" => self.cmd_list_artifacts(fields, state).await,
            "PEEK_HEAD" => self.cmd_peek_head(fields, run_id, limits, state).await,
            "PEEK_RANGE" => self.cmd_peek_range(fields, run_id, limits, state).await,
            "GREP" => self.cmd_grep(fields, run_id, limits, state).await,
            "CHUNK_BY_NEWLINE" => self.cmd_chunk_by_newline(fields, state),
            "SUBCALL" => self.cmd_subcall(fields, limits, state).await,
            "SUBRLM_RUN" => self.cmd_subrlm_run(fields, limits, state).await,
            "SET" => self.cmd_set(fields, state),
            "APPEND" => self.cmd_append(fields, state),
            "FINAL" => self.cmd_final(fields, state),
            "FINAL_TEXT" => self.cmd_final_text(fields, state),
            "STOP" => {
                state.stopped = true;
                Ok(Value::Null)
            }
            other => Err(format!("unrecognized command `{other}`")),
        }
    }

    async fn cmd_list_artifacts(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let query = fields.get("query").cloned().unwrap_or_default();
        if query.trim().is_empty() {
            return Err("empty_query_not_allowed".to_string());
        }
        let top_k = field_i64(fields, "top_k", 20).clamp(1, 200);
        let include_global = field_bool(fields, "include_global", true);
        let allowed_types = field_list(fields, "allowed_types");

        let session_id = fields.get("session_id").cloned().unwrap_or_default();
        let options = RetrievalOptions { include_global, top_k, preview_chars: 240, allowed_types };
        let retrieval = RetrievalService::new(self.store);
        let index = retrieval
            .build_candidate_index(&session_id, &query, options)
            .await
            .map_err(|e| e.to_string())?;

        let result = json!({"candidates": index.candidates});
        if let Some(name) = fields.get("store") {
            state.variables.insert(name.clone(), result.clone());
        }
        Ok(result)
    }

    async fn cmd_peek_head(
        &self,
        fields: &Map<String, String>,
        run_id: &str,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        let artifact_id = fields.get("artifact_id").cloned().ok_or("artifact_id required")?;
        let head_chars = field_i64(fields, "head_chars", 800).clamp(1, 20_000);
        let (text, content_hash) = self.fetch_artifact(&artifact_id).await?;
        let extracted = extract_head(&text, head_chars, limits.max_glimpse_chars);
        self.record_glimpse(&artifact_id, &content_hash, "head", extracted.text, run_id, limits, fields, state).await
    }

    async fn cmd_peek_range(
        &self,
        fields: &Map<String, String>,
        run_id: &str,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        let artifact_id = fields.get("artifact_id").cloned().ok_or("artifact_id required")?;
        let start = field_i64(fields, "start", 0);
        let end = field_i64(fields, "end", 0);
        let (text, content_hash) = self.fetch_artifact(&artifact_id).await?;
        let extracted = extract_range(&text, start, end);
        self.record_glimpse(&artifact_id, &content_hash, "range", extracted.text, run_id, limits, fields, state).await
    }

    async fn cmd_grep(
        &self,
        fields: &Map<String, String>,
        run_id: &str,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        let artifact_id = fields.get("artifact_id").cloned().ok_or("artifact_id required")?;
        let pattern = fields.get("pattern").cloned().ok_or("pattern required")?;
        let max_lines = field_i64(fields, "max_lines", 20).clamp(1, 200);
        let (text, content_hash) = self.fetch_artifact(&artifact_id).await?;
        let matched = extract_grep_lines(&text, &pattern, max_lines);
        self.record_glimpse(&artifact_id, &content_hash, "grep", matched, run_id, limits, fields, state).await
    }

    fn cmd_chunk_by_newline(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let source = fields.get("source").cloned().unwrap_or_else(|| "last".to_string());
        let max_lines = field_i64(fields, "max_lines", 40).max(1) as usize;
        let max_chars = field_i64(fields, "max_chars", 2000).max(1) as usize;

        let text = if source == "last" {
            state.last_glimpse_text.clone()
        } else {
            state.variables.get(&source).and_then(|v| v.as_str()).unwrap_or_default().to_string()
        };

        let mut chunks = Vec::new();
        let mut current_lines: Vec<&str> = Vec::new();
        let mut current_len = 0usize;
        for line in text.lines() {
            if (current_lines.len() >= max_lines || current_len + line.len() > max_chars) && !current_lines.is_empty()
            {
                chunks.push(current_lines.join("\n"));
                current_lines.clear();
                current_len = 0;
            }
            current_len += line.len() + 1;
            current_lines.push(line);
        }
        if !current_lines.is_empty() {
            chunks.push(current_lines.join("\n"));
        }

        let result = json!(chunks);
        if let Some(name) = fields.get("store") {
            state.variables.insert(name.clone(), result.clone());
        }
        Ok(result)
    }

    async fn cmd_subcall(
        &self,
        fields: &Map<String, String>,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        self.check_subcall_budget(limits, state)?;
        let prompt = fields.get("prompt").cloned().ok_or("prompt required")?;
        let max_tokens = fields.get("max_tokens").and_then(|v| v.parse::<i64>().ok()).map(|v| v.clamp(1, 4096));
        let temperature = fields.get("temperature").and_then(|v| v.parse::<f64>().ok()).map(|v| v.clamp(0.0, 2.0));

        let raw = self.adapter.complete_raw(&prompt, max_tokens, temperature).await.map_err(|e| e.to_string())?;
        state.subcall_count += 1;
        let result = json!({"raw": raw});
        if let Some(name) = fields.get("store") {
            state.variables.insert(name.clone(), result.clone());
        }
        Ok(result)
    }

    async fn cmd_subrlm_run(
        &self,
        fields: &Map<String, String>,
        limits: &ReplLimits,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        self.check_subcall_budget(limits, state)?;
        let parent_run_id = fields.get("parent_run_id").cloned().unwrap_or_default();
        let session_id = fields.get("session_id").cloned().unwrap_or_default();
        let prompt = fields.get("prompt").cloned().ok_or("prompt required")?;

        let child_run_id = self
            .run_store
            .insert_run(
                &session_id,
                &prompt,
                &json!({"parent_run_id": parent_run_id, "subcall_id": state.subcall_count}),
                &json!({}),
            )
            .await
            .map_err(|e| e.to_string())?;

        let result = self.cmd_subcall(fields, limits, state).await?;
        let mut tagged = result;
        tagged["child_run_id"] = json!(child_run_id);
        if let Some(name) = fields.get("store") {
            state.variables.insert(name.clone(), tagged.clone());
        }
        Ok(tagged)
    }

    fn check_subcall_budget(&self, limits: &ReplLimits, state: &ReplState) -> Result<(), String> {
        if state.subcall_count >= limits.max_subcalls {
            return Err("max_subcalls exceeded".to_string());
        }
        Ok(())
    }

    fn cmd_set(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let name = fields.get("name").cloned().ok_or("name required")?;
        let value = fields.get("value").cloned().unwrap_or_default();
        state.variables.insert(name, json!(value));
        Ok(Value::Null)
    }

    fn cmd_append(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let name = fields.get("name").cloned().ok_or("name required")?;
        let value = fields.get("value").cloned().unwrap_or_default();
        let existing = state.variables.get(&name).and_then(|v| v.as_str()).unwrap_or("").to_string();
        state.variables.insert(name, json!(format!("{existing}{value}")));
        Ok(Value::Null)
    }

    fn cmd_final(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let name = fields.get("name").cloned().ok_or("name required")?;
        let value = state.variables.get(&name).and_then(|v| v.as_str()).unwrap_or("").to_string();
        state.final_text = Some(value.clone());
        state.stopped = true;
        Ok(json!(value))
    }

    fn cmd_final_text(&self, fields: &Map<String, String>, state: &mut ReplState) -> Result<Value, String> {
        let text = fields.get("text").cloned().unwrap_or_default();
        state.final_text = Some(text.clone());
        state.stopped = true;
        Ok(json!(text))
    }

    async fn fetch_artifact(&self, artifact_id: &str) -> Result<(String, String), String> {
        let content = self.store.get_content(artifact_id).await.map_err(|e| e.to_string())?;
        Ok((content.content, content.content_hash))
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_glimpse(
        &self,
        artifact_id: &str,
        content_hash: &str,
        mode: &str,
        text: String,
        run_id: &str,
        limits: &ReplLimits,
        fields: &Map<String, String>,
        state: &mut ReplState,
    ) -> Result<Value, String> {
        if text.is_empty() {
            return Err("glimpse extracted empty text".to_string());
        }
        state.total_glimpse_chars += text.chars().count() as i64;
        if state.total_glimpse_chars > limits.max_total_glimpse_chars {
            return Err("max_total_glimpse_chars exceeded".to_string());
        }

        let gid = rlm_cache::glimpse_id(artifact_id, content_hash, &json!({"mode": mode, "fields": fields}));
        self.cache
            .set(
                run_id,
                &gid,
                &rlm_cache::CachedGlimpse { meta: json!({"artifact_id": artifact_id, "mode": mode}), text: text.clone() },
                86_400,
            )
            .await;

        state.last_glimpse_text = text.clone();
        let record = json!({"artifact_id": artifact_id, "mode": mode, "text": text});
        state.glimpses.push(record.clone());
        if let Some(name) = fields.get("store") {
            state.variables.insert(name.clone(), record.clone());
        }
        Ok(record)
    }
}

fn fenced_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```rlm_repl\s*\n(.*?)```").unwrap())
}

fn extract_fenced_block(text: &str) -> String {
    match fenced_block_pattern().captures(text) {
        Some(caps) => caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        None => text.to_string(),
    }
}

/// Quote-aware shell-style tokenizer: splits on whitespace, honoring single
/// and double quotes (no escape processing inside single quotes).
fn shell_tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            '\\' if in_double => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                    has_token = true;
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Splits a command line into its name and `key=value` fields. Bare tokens
/// with no `=` are joined with spaces as a fallback positional `value`.
fn parse_command_line(line: &str) -> Option<(String, Map<String, String>)> {
    let tokens = shell_tokenize(line);
    let (first, rest) = tokens.split_first()?;
    let name = first.to_uppercase();

    let mut fields = Map::new();
    let mut positional = Vec::new();
    for tok in rest {
        if let Some((k, v)) = tok.split_once('=') {
            fields.insert(k.to_string(), Value::String(v.to_string()));
        } else {
            positional.push(tok.clone());
        }
    }
    if !positional.is_empty() && !fields.contains_key("value") {
        fields.insert("value".to_string(), Value::String(positional.join(" ")));
    }

    let fields: Map<String, String> =
        fields.into_iter().map(|(k, v)| (k, v.as_str().unwrap_or_default().to_string())).collect();
    Some((name, fields))
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap())
}

fn substitute_vars(value: &str, variables: &Map<String, Value>) -> String {
    variable_pattern()
        .replace_all(value, |caps: &regex::Captures| {
            let name = &caps[1];
            variables.get(name).map(value_to_string).unwrap_or_default()
        })
        .into_owned()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn field_i64(fields: &Map<String, String>, key: &str, default: i64) -> i64 {
    fields.get(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(default)
}

fn field_bool(fields: &Map<String, String>, key: &str, default: bool) -> bool {
    fields.get(key).and_then(|v| v.parse::<bool>().ok()).unwrap_or(default)
}

fn field_list(fields: &Map<String, String>, key: &str) -> Vec<String> {
    fields
        .get(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootlm::adapter::MockAdapter;
    use sqlx::sqlite::SqlitePool;

    async fn seeded_store() -> CandidateStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE artifacts (id TEXT PRIMARY KEY, content TEXT, content_hash TEXT, metadata TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO artifacts (id, content, content_hash, metadata) VALUES (?1, ?2, ?3, '{}')")
            .bind("a1")
            .bind("line one\nline two\nline three\n")
            .bind("hash-a1")
            .execute(&pool)
            .await
            .unwrap();
        CandidateStore::new(pool)
    }

    async fn run_store() -> RunStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE rlm_runs (
                id TEXT PRIMARY KEY, session_id TEXT, query TEXT, options TEXT, candidate_index TEXT,
                program TEXT, meta TEXT, events TEXT, glimpses TEXT, glimpses_meta TEXT, subcalls TEXT,
                evidence TEXT, final TEXT, final_answer TEXT, citations TEXT, assembled_context TEXT,
                rendered_prompt TEXT, llm_raw TEXT, errors TEXT, status TEXT, created_at TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        RunStore::new(pool)
    }

    #[tokio::test]
    async fn peek_head_records_a_glimpse_and_writes_through_the_cache() {
        let store = seeded_store().await;
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let runs = run_store().await;
        let adapter = MockAdapter;
        let repl = ReplExecutor::new(&store, &cache, &runs, &adapter);

        let outcome = repl
            .run("PEEK_HEAD artifact_id=a1 head_chars=40\nFINAL_TEXT text=done", "run-1", &ReplLimits::default())
            .await;

        assert_eq!(outcome.glimpses.len(), 1);
        assert_eq!(outcome.final_text.as_deref(), Some("done"));
        assert_eq!(outcome.events[0]["status"], "ok");
    }

    #[tokio::test]
    async fn grep_on_a_missing_artifact_is_recorded_as_an_error_but_does_not_stop_the_run() {
        let store = seeded_store().await;
        let cache = GlimpseCache::new("redis://127.0.0.1:1").unwrap();
        let runs = run_store().await;
        let adapter = MockAdapter;
        let repl = ReplExecutor::new(&store, &cache, &runs, &adapter);

        let outcome = repl
            .run("GREP artifact_id=missing pattern=line\nFINAL_TEXT text=done", "run-1", &ReplLimits::default())
            .await;

        assert_eq!(outcome.events[0]["status"], "error");
        assert_eq!(outcome.final_text.as_deref(), Some("done"));
    }

    #[test]
    fn shell_tokenize_honors_quotes() {
        let tokens = shell_tokenize(r#"SET name=foo value="hello world""#);
        assert_eq!(tokens, vec!["SET", "name=foo", "value=hello world"]);
    }

    #[test]
    fn parse_command_line_uppercases_name_and_splits_fields() {
        let (name, fields) = parse_command_line("peek_head artifact_id=a1 head_chars=40").unwrap();
        assert_eq!(name, "PEEK_HEAD");
        assert_eq!(fields.get("artifact_id").unwrap(), "a1");
        assert_eq!(fields.get("head_chars").unwrap(), "40");
    }

    #[test]
    fn substitute_vars_replaces_known_and_blanks_unknown() {
        let mut vars = Map::new();
        vars.insert("x".to_string(), json!("hello"));
        assert_eq!(substitute_vars("say ${x} to ${y}", &vars), "say hello to ");
    }

    #[test]
    fn fenced_block_extraction_prefers_first_rlm_repl_fence() {
        let text = "intro\n```rlm_repl\nSET a=1\nFINAL_TEXT text=done\n```\ntrailer";
        let block = extract_fenced_block(text);
        assert!(block.contains("SET a=1"));
        assert!(!block.contains("trailer"));
    }

    #[test]
    fn fenced_block_extraction_falls_back_to_whole_text() {
        let text = "SET a=1\nFINAL_TEXT text=done";
        assert_eq!(extract_fenced_block(text), text);
    }
}
