//! Candidate Store (C1, §4.1): scope-filtered, lexical-scored artifact lookup.

use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::RetrievalError;
use crate::models::{Candidate, CandidateIndex, RetrievalOptions, ScoreBreakdown};

#[derive(Debug, Clone)]
pub struct ArtifactContent {
    pub content: String,
    pub content_hash: String,
    pub metadata: Value,
}

pub struct CandidateStore {
    pool: SqlitePool,
}

impl CandidateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolves a session to its owning project, or `session_not_found`.
    pub async fn project_of(&self, session_id: &str) -> Result<String, RetrievalError> {
        let row = sqlx::query("SELECT project_id FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get::<String, _>("project_id")),
            None => Err(RetrievalError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Builds a scope-filtered, lexically scored candidate index (§4.1).
    pub async fn list_candidates(
        &self,
        session_id: &str,
        query: &str,
        tokens: &[String],
        options: &RetrievalOptions,
    ) -> Result<CandidateIndex, RetrievalError> {
        let project_id = self.project_of(session_id).await?;

        let mut scopes = vec!["session".to_string(), "project".to_string()];
        if options.include_global {
            scopes.push("global".to_string());
        }

        let allowed_types: Vec<String> = if options.allowed_types.is_empty() {
            vec!["doc".into(), "code".into(), "note".into()]
        } else {
            options.allowed_types.clone()
        };

        let scope_placeholders = placeholders(scopes.len());
        let type_placeholders = placeholders(allowed_types.len());

        let sql = format!(
            "SELECT id, scope, type, title, content, content_hash, pinned, weight, source, \
             token_estimate, created_at \
             FROM artifacts \
             WHERE status = 'active' \
               AND project_id = ? \
               AND scope IN ({scope_placeholders}) \
               AND type IN ({type_placeholders}) \
               AND (scope <> 'session' OR session_id = ?)"
        );

        let mut q = sqlx::query(&sql).bind(&project_id);
        for s in &scopes {
            q = q.bind(s);
        }
        for t in &allowed_types {
            q = q.bind(t);
        }
        q = q.bind(session_id);

        let rows = q.fetch_all(&self.pool).await?;

        let lowered_tokens: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        let preview_chars = options.preview_chars.max(0) as usize;

        let mut candidates: Vec<(Candidate, f64, i64)> = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row.get("content");
            let lowered_content = content.to_lowercase();
            let hit_count = lowered_tokens
                .iter()
                .filter(|t| !t.is_empty() && lowered_content.contains(t.as_str()))
                .count() as f64;

            let weight: f64 = row.get("weight");
            let pinned: bool = row.get::<i64, _>("pinned") != 0;
            let base_score = Candidate::compute_base_score(weight, hit_count, pinned);
            let created_at: String = row.get("created_at");

            let preview: String = content.chars().take(preview_chars).collect();

            let candidate = Candidate {
                artifact_id: row.get("id"),
                scope: row.get("scope"),
                kind: row.get("type"),
                title: row.get("title"),
                content_hash: row.get("content_hash"),
                pinned,
                weight,
                source: row.get("source"),
                content_preview: preview,
                token_estimate: row.get("token_estimate"),
                base_score,
                score_breakdown: ScoreBreakdown {
                    weight,
                    hit_count,
                    pinned_bonus: if pinned { 5.0 } else { 0.0 },
                },
            };
            candidates.push((candidate, hit_count, parse_sortable_time(&created_at)));
        }

        candidates.sort_by(|a, b| {
            b.0.pinned
                .cmp(&a.0.pinned)
                .then(b.0.weight.partial_cmp(&a.0.weight).unwrap_or(std::cmp::Ordering::Equal))
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(b.2.cmp(&a.2))
        });

        let top_k = options.top_k.max(1) as usize;
        let candidates: Vec<Candidate> = candidates.into_iter().take(top_k).map(|(c, _, _)| c).collect();

        Ok(CandidateIndex {
            session_id: session_id.to_string(),
            project_id,
            query: query.to_string(),
            candidates,
        })
    }

    /// Fetches the full body, content hash and metadata for one artifact.
    pub async fn get_content(&self, artifact_id: &str) -> Result<ArtifactContent, RetrievalError> {
        let row = sqlx::query("SELECT content, content_hash, metadata FROM artifacts WHERE id = ?1")
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let metadata_raw: Option<String> = row.get("metadata");
                let metadata = metadata_raw
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(Value::Object(Default::default()));
                Ok(ArtifactContent {
                    content: row.get("content"),
                    content_hash: row.get("content_hash"),
                    metadata,
                })
            }
            None => Err(RetrievalError::ArtifactNotFound(artifact_id.to_string())),
        }
    }

    pub async fn get_artifact_text(&self, artifact_id: &str) -> Result<String, RetrievalError> {
        Ok(self.get_content(artifact_id).await?.content)
    }

    pub async fn get_artifact_metadata(&self, artifact_id: &str) -> Result<Value, RetrievalError> {
        Ok(self.get_content(artifact_id).await?.metadata)
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

/// `created_at` is stored as an RFC3339 string; lexical ordering of that
/// format is already chronological, so we key on the raw bytes.
fn parse_sortable_time(s: &str) -> i64 {
    s.bytes().fold(0i64, |acc, b| acc.wrapping_mul(257).wrapping_add(b as i64))
}
