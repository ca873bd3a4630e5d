//! Data model shared across the candidate store, run store and retrieval service.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Project,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Project => "project",
            Scope::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Doc,
    Code,
    Note,
    Cache,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Doc => "doc",
            ArtifactType::Code => "code",
            ArtifactType::Note => "note",
            ArtifactType::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Manual,
    Import,
    System,
    LlmSuggestion,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Active,
    Archived,
    Deleted,
}

/// A unit of knowledge attached to a project, optionally scoped to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub project_id: Uuid,
    pub session_id: Option<Uuid>,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub kind: ArtifactType,
    pub title: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub token_estimate: Option<i64>,
    pub metadata: HashMap<String, Value>,
    pub weight: f64,
    pub pinned: bool,
    pub source: ArtifactSource,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn content_hash_of(content: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(content.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Score components behind a candidate's `base_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub weight: f64,
    pub hit_count: f64,
    pub pinned_bonus: f64,
}

/// A ranked retrieval row derived from an artifact for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub artifact_id: String,
    pub scope: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    pub content_hash: String,
    pub pinned: bool,
    pub weight: f64,
    pub source: String,
    pub content_preview: String,
    pub token_estimate: Option<i64>,
    pub base_score: f64,
    pub score_breakdown: ScoreBreakdown,
}

impl Candidate {
    pub fn compute_base_score(weight: f64, hit_count: f64, pinned: bool) -> f64 {
        weight + 0.2 * hit_count + if pinned { 5.0 } else { 0.0 }
    }
}

/// The ranked, ordered result of one retrieval query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateIndex {
    pub session_id: String,
    pub project_id: String,
    pub query: String,
    pub candidates: Vec<Candidate>,
}

impl CandidateIndex {
    pub fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Options accepted by retrieval / orchestration requests (`options` in §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    pub include_global: bool,
    pub top_k: i64,
    pub preview_chars: i64,
    pub allowed_types: Vec<String>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            include_global: true,
            top_k: 20,
            preview_chars: 240,
            allowed_types: vec!["doc".into(), "code".into(), "note".into()],
        }
    }
}

/// One span within a glimpse excerpt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GlimpseSpan {
    Single { start: usize, end: usize },
    Multi { spans: Vec<(usize, usize)> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlimpseMeta {
    pub step: i64,
    pub source: String,
    pub artifact_id: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// An excerpt produced by one `glimpse` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Glimpse {
    pub artifact_id: String,
    pub mode: String,
    pub text: String,
    pub span: GlimpseSpan,
    pub hash: String,
    pub glimpse_meta: GlimpseMeta,
}

/// One orchestrator-emitted event, appended to a run's `events` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventPayload {
    pub step: i64,
    pub action: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Degraded,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Degraded => "degraded",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Ok
    }
}

/// A durable run record (`rlm_runs` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub options: Value,
    pub candidate_index: Value,
    pub program: Value,
    pub meta: Value,
    pub events: Vec<Value>,
    pub glimpses: Vec<Value>,
    pub glimpses_meta: Vec<Value>,
    pub subcalls: Vec<Value>,
    pub evidence: Vec<Value>,
    pub final_payload: Value,
    pub final_answer: Option<String>,
    pub citations: Vec<Value>,
    pub assembled_context: Value,
    pub rendered_prompt: Option<String>,
    pub llm_raw: Vec<Value>,
    pub errors: Vec<Value>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// A single `rlm_run_events` log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    pub id: i64,
    pub run_id: String,
    pub event: Value,
    pub created_at: DateTime<Utc>,
}

/// The full snapshot written by `update_run_payload` (overwrite semantics).
#[derive(Debug, Clone, Default)]
pub struct RunPayloadUpdate {
    pub program: Value,
    pub meta: Value,
    pub events: Vec<Value>,
    pub glimpses: Vec<Value>,
    pub glimpses_meta: Vec<Value>,
    pub subcalls: Vec<Value>,
    pub final_payload: Value,
    pub final_answer: Option<String>,
    pub citations: Vec<Value>,
    pub status: RunStatus,
    pub errors: Vec<Value>,
}

/// Selective patch accepted by the legacy `update_run` path (assembly variant only).
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub program: Option<Value>,
    pub program_meta: Option<Value>,
    pub events: Option<Vec<Value>>,
    pub glimpses: Option<Vec<Value>>,
    pub subcalls: Option<Vec<Value>>,
    pub final_answer: Option<String>,
    pub citations: Option<Vec<Value>>,
    pub options: Option<Value>,
    pub candidate_index: Option<Value>,
    pub errors: Option<Vec<Value>>,
    pub status: Option<String>,
}
