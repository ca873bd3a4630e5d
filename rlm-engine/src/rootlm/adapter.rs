//! Root-LM Adapter (C4, §4.4): polymorphic interface with Mock and
//! HTTP-Chat backends.

use std::sync::Arc;

use async_trait::async_trait;
use rlm_core::models::CandidateIndex;
use serde_json::{json, Value};
use tracing::warn;

use crate::rootlm::parse::{extract_message_content, tolerant_parse};
use crate::rootlm::transport::{AdapterError, SyncTransport, UreqTransport};

#[derive(Debug, Clone)]
pub struct ProgramResult {
    pub program: Value,
    pub meta: Value,
    pub raw: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FinalResult {
    pub final_payload: Value,
    pub meta: Value,
    pub raw: Option<String>,
}

/// §4.4 retry policy: non-retry on timeout or <500, retry on 5xx/network up
/// to `max_retries`, sleeping `backoff_s` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout_s: f64,
    pub max_retries: u32,
    pub backoff_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { timeout_s: 30.0, max_retries: 2, backoff_s: 0.5 }
    }
}

impl RetryPolicy {
    /// Clones the policy with a one-off per-call timeout override (§4.4).
    pub fn with_timeout(&self, timeout_s: f64) -> Self {
        Self { timeout_s, ..self.clone() }
    }
}

#[async_trait]
pub trait RootLmAdapter: Send + Sync {
    async fn generate_program(
        &self,
        index: &CandidateIndex,
        policy: &Value,
        limits: &Value,
        options: &Value,
    ) -> Result<ProgramResult, AdapterError>;

    async fn generate_final(
        &self,
        index: &CandidateIndex,
        evidence: &Value,
        subcalls: &Value,
        options: &Value,
    ) -> Result<FinalResult, AdapterError>;

    /// A single freeform completion, used by the REPL's `SUBCALL`/`SUBRLM_RUN`
    /// commands (§4.5a) rather than the structured program/final protocol.
    async fn complete_raw(
        &self,
        prompt: &str,
        max_tokens: Option<i64>,
        temperature: Option<f64>,
    ) -> Result<String, AdapterError>;
}

/// Deterministic backend used by default and as a fallback target (§4.4).
pub struct MockAdapter;

#[async_trait]
impl RootLmAdapter for MockAdapter {
    async fn generate_program(
        &self,
        index: &CandidateIndex,
        policy: &Value,
        limits: &Value,
        _options: &Value,
    ) -> Result<ProgramResult, AdapterError> {
        let steps = match index.first_candidate() {
            Some(candidate) => vec![
                json!({"action": "select", "selected_ids": [candidate.artifact_id]}),
                json!({"action": "glimpse", "artifact_id": candidate.artifact_id, "mode": "head", "n": 800}),
            ],
            None => Vec::new(),
        };
        let candidate_ids: Vec<&str> = index.candidates.iter().map(|c| c.artifact_id.as_str()).collect();

        Ok(ProgramResult {
            program: json!({
                "steps": steps,
                "candidate_ids": candidate_ids,
                "policy": policy,
                "limits": limits,
            }),
            meta: json!({"backend": "mock", "parsed": true}),
            raw: None,
        })
    }

    async fn generate_final(
        &self,
        index: &CandidateIndex,
        _evidence: &Value,
        _subcalls: &Value,
        options: &Value,
    ) -> Result<FinalResult, AdapterError> {
        let answer = options
            .get("final_answer")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("Mock answer for: {}", index.query));

        Ok(FinalResult {
            final_payload: json!({"answer": answer, "citations": []}),
            meta: json!({"backend": "mock", "parsed": true}),
            raw: None,
        })
    }

    async fn complete_raw(
        &self,
        prompt: &str,
        _max_tokens: Option<i64>,
        _temperature: Option<f64>,
    ) -> Result<String, AdapterError> {
        Ok(format!("Mock completion for: {prompt}"))
    }
}

/// OpenAI-compatible `POST {base}/v1/chat/completions` backend (§4.4).
#[derive(Clone)]
pub struct HttpChatAdapter {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: i64,
    temperature: f64,
    stop: Vec<String>,
    extra: Value,
    retry: RetryPolicy,
    transport: Arc<dyn SyncTransport>,
}

impl HttpChatAdapter {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key,
            model: model.to_string(),
            max_tokens: 512,
            temperature: 0.2,
            stop: Vec::new(),
            extra: json!({}),
            retry: RetryPolicy::default(),
            transport: Arc::new(UreqTransport),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    fn with_call_overrides(&self, max_tokens: Option<i64>, temperature: Option<f64>) -> Self {
        let mut adapter = self.clone();
        if let Some(v) = max_tokens {
            adapter.max_tokens = v;
        }
        if let Some(v) = temperature {
            adapter.temperature = v;
        }
        adapter
    }

    fn build_request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !self.stop.is_empty() {
            body["stop"] = json!(self.stop);
        }
        if let Value::Object(extra) = &self.extra {
            if let Value::Object(obj) = &mut body {
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }

    /// Calls the chat-completions endpoint with the retry policy in §4.4,
    /// returning the assistant's raw content string.
    async fn chat_completion(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AdapterError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut headers: Vec<(String, String)> = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        let body = serde_json::to_string(&self.build_request_body(system_prompt, user_prompt))?;

        let mut attempt: u32 = 0;
        loop {
            let transport = self.transport.clone();
            let url = url.clone();
            let headers_owned = headers.clone();
            let body = body.clone();
            let timeout_s = self.retry.timeout_s;

            let result = tokio::task::spawn_blocking(move || {
                let header_refs: Vec<(&str, &str)> =
                    headers_owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                transport.post_json(&url, &header_refs, &body, timeout_s)
            })
            .await
            .map_err(|e| AdapterError::Io(e.to_string()))?;

            match result {
                Ok(raw) => {
                    return extract_message_content(&raw)
                        .ok_or_else(|| AdapterError::InvalidResponse("missing choices[0].message.content".to_string()));
                }
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(match &err {
                            AdapterError::Timeout(_) => err,
                            _ if attempt > 0 => AdapterError::RetriesExhausted {
                                attempts: attempt + 1,
                                last_error: err.to_string(),
                            },
                            _ => err,
                        });
                    }
                    warn!(attempt, error = %err, "root-lm request failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs_f64(self.retry.backoff_s)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl RootLmAdapter for HttpChatAdapter {
    async fn generate_program(
        &self,
        index: &CandidateIndex,
        policy: &Value,
        limits: &Value,
        _options: &Value,
    ) -> Result<ProgramResult, AdapterError> {
        let system_prompt = "Respond with JSON only: {\"program\": {\"steps\": [...], \"candidate_ids\": [...], \"policy\": {...}, \"limits\": {...}}}";
        let user_prompt = serde_json::to_string(&json!({
            "query": index.query,
            "candidates": index.candidates,
            "policy": policy,
            "limits": limits,
        }))?;

        let raw = self.chat_completion(system_prompt, &user_prompt).await?;
        let parsed = tolerant_parse(&raw);

        let program = parsed
            .value
            .as_ref()
            .and_then(|v| v.get("program"))
            .cloned()
            .unwrap_or_else(|| json!({"steps": []}));

        Ok(ProgramResult {
            program,
            meta: json!({"backend": "vllm", "parsed": parsed.parsed}),
            raw: Some(raw),
        })
    }

    async fn generate_final(
        &self,
        _index: &CandidateIndex,
        evidence: &Value,
        subcalls: &Value,
        _options: &Value,
    ) -> Result<FinalResult, AdapterError> {
        let system_prompt = "Respond with JSON only: {\"final\": {\"answer\": str, \"citations\": [...]}}";
        let user_prompt = serde_json::to_string(&json!({"evidence": evidence, "subcalls": subcalls}))?;

        let raw = self.chat_completion(system_prompt, &user_prompt).await?;
        let parsed = tolerant_parse(&raw);

        let final_payload = match parsed.value.as_ref().and_then(|v| v.get("final")) {
            Some(value) => value.clone(),
            None => json!({"answer": raw, "citations": []}),
        };

        Ok(FinalResult {
            final_payload,
            meta: json!({"backend": "vllm", "parsed": parsed.parsed}),
            raw: Some(raw),
        })
    }

    async fn complete_raw(
        &self,
        prompt: &str,
        max_tokens: Option<i64>,
        temperature: Option<f64>,
    ) -> Result<String, AdapterError> {
        let adapter = self.with_call_overrides(max_tokens, temperature);
        adapter.chat_completion("Respond with plain text only.", prompt).await
    }
}

/// Strips a trailing `/` and trailing `/v1` from a configured base url.
fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::models::{Candidate, ScoreBreakdown};

    fn sample_index(with_candidate: bool) -> CandidateIndex {
        let candidates = if with_candidate {
            vec![Candidate {
                artifact_id: "a1".into(),
                scope: "session".into(),
                kind: "note".into(),
                title: None,
                content_hash: "h".into(),
                pinned: false,
                weight: 1.0,
                source: "manual".into(),
                content_preview: "hi".into(),
                token_estimate: None,
                base_score: 1.0,
                score_breakdown: ScoreBreakdown { weight: 1.0, hit_count: 0.0, pinned_bonus: 0.0 },
            }]
        } else {
            Vec::new()
        };
        CandidateIndex { session_id: "s1".into(), project_id: "p1".into(), query: "hello".into(), candidates }
    }

    #[tokio::test]
    async fn mock_program_selects_and_glimpses_first_candidate() {
        let index = sample_index(true);
        let result = MockAdapter
            .generate_program(&index, &json!({}), &json!({}), &json!({}))
            .await
            .unwrap();
        let steps = result.program["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["action"], "select");
        assert_eq!(steps[1]["action"], "glimpse");
    }

    #[tokio::test]
    async fn mock_program_is_empty_with_no_candidates() {
        let index = sample_index(false);
        let result = MockAdapter
            .generate_program(&index, &json!({}), &json!({}), &json!({}))
            .await
            .unwrap();
        assert!(result.program["steps"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_final_answer_defaults_to_templated_string() {
        let index = sample_index(true);
        let result = MockAdapter
            .generate_final(&index, &json!([]), &json!([]), &json!({}))
            .await
            .unwrap();
        assert_eq!(result.final_payload["answer"], "Mock answer for: hello");
    }

    #[tokio::test]
    async fn mock_final_answer_honors_override() {
        let index = sample_index(true);
        let result = MockAdapter
            .generate_final(&index, &json!([]), &json!([]), &json!({"final_answer": "custom"}))
            .await
            .unwrap();
        assert_eq!(result.final_payload["answer"], "custom");
    }

    #[test]
    fn base_url_strips_trailing_slash_and_v1() {
        assert_eq!(normalize_base_url("http://host:8000/v1/"), "http://host:8000");
        assert_eq!(normalize_base_url("http://host:8000"), "http://host:8000");
    }

    #[tokio::test]
    async fn http_chat_uses_fake_transport_and_parses_response() {
        let body = json!({"choices": [{"message": {"content": "{\"final\": {\"answer\": \"ok\", \"citations\": []}}"}}]});
        let fake = crate::rootlm::transport::FakeTransport::new(&body.to_string());
        let adapter = HttpChatAdapter::new("http://host:8000", None, "test-model").with_transport(Arc::new(fake));
        let index = sample_index(true);
        let result = adapter.generate_final(&index, &json!([]), &json!([]), &json!({})).await.unwrap();
        assert_eq!(result.final_payload["answer"], "ok");
        assert!(result.meta["parsed"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn mock_complete_raw_echoes_the_prompt() {
        let raw = MockAdapter.complete_raw("hello there", None, None).await.unwrap();
        assert_eq!(raw, "Mock completion for: hello there");
    }

    #[tokio::test]
    async fn http_chat_non_retryable_error_fails_immediately() {
        let fake = crate::rootlm::transport::FakeTransport::with_error(AdapterError::Http { status: 400, message: "bad".into() });
        let adapter = HttpChatAdapter::new("http://host:8000", None, "test-model").with_transport(Arc::new(fake));
        let index = sample_index(true);
        let err = adapter.generate_final(&index, &json!([]), &json!([]), &json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::Http { status: 400, .. }));
    }
}
