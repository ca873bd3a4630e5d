//! Retrieval Service (C7, §4.2): tokenizer + option clamp + Candidate Store.

use crate::candidate_store::CandidateStore;
use crate::error::RetrievalError;
use crate::models::{CandidateIndex, RetrievalOptions};
use crate::tokenizer::{build_tokens, clamp_i64};

const MAX_TOKENS: usize = 12;

pub struct RetrievalService<'a> {
    store: &'a CandidateStore,
}

impl<'a> RetrievalService<'a> {
    pub fn new(store: &'a CandidateStore) -> Self {
        Self { store }
    }

    /// Builds a deterministic `CandidateIndex` for one query (§4.2).
    pub async fn build_candidate_index(
        &self,
        session_id: &str,
        query: &str,
        mut options: RetrievalOptions,
    ) -> Result<CandidateIndex, RetrievalError> {
        options.top_k = clamp_i64(options.top_k, 1, 200);
        options.preview_chars = clamp_i64(options.preview_chars, 0, 4000);
        if options.allowed_types.is_empty() {
            options.allowed_types = vec!["doc".into(), "code".into(), "note".into()];
        }

        let mut tokens = build_tokens(query, MAX_TOKENS);
        if tokens.is_empty() {
            tokens = vec![query.to_string()];
        }

        self.store.list_candidates(session_id, query, &tokens, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clamps_out_of_range_options() {
        let pool = sqlx::sqlite::SqlitePool::connect(":memory:").await.unwrap();
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
        sqlx::query("INSERT INTO sessions (id, project_id) VALUES ('s1', 'p1')")
            .execute(&pool)
            .await
            .unwrap();

        let store = CandidateStore::new(pool);
        let service = RetrievalService::new(&store);
        let mut opts = RetrievalOptions::default();
        opts.top_k = 10_000;
        opts.preview_chars = -5;
        let index = service.build_candidate_index("s1", "hello world", opts).await.unwrap();
        assert_eq!(index.query, "hello world");
    }
}
