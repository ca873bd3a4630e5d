//! Run Store (C2, §4.7): durable RLM run records with a per-run event log.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::RunStoreError;
use crate::models::{Run, RunEventRow, RunPatch, RunPayloadUpdate, RunStatus};

pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a run row with defaults, returning its id.
    pub async fn insert_run(
        &self,
        session_id: &str,
        query: &str,
        options: &Value,
        candidate_index: &Value,
    ) -> Result<String, RunStoreError> {
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO rlm_runs (
                id, session_id, query, options, candidate_index, program, meta,
                events, glimpses, glimpses_meta, subcalls, evidence, final, final_answer,
                citations, assembled_context, rendered_prompt, llm_raw, errors, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, '{}', '{}', '[]', '[]', '[]', '[]', '[]', '{}', NULL, '[]', '{}', NULL, '[]', '[]', 'ok', ?6)",
        )
        .bind(&run_id)
        .bind(session_id)
        .bind(query)
        .bind(serde_json::to_string(options)?)
        .bind(serde_json::to_string(candidate_index)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    /// Atomic full-snapshot overwrite of the round-scoped columns (§9 open
    /// question: overwrite, not append).
    pub async fn update_run_payload(&self, run_id: &str, update: &RunPayloadUpdate) -> Result<(), RunStoreError> {
        let result = sqlx::query(
            "UPDATE rlm_runs SET
                program = ?1,
                meta = ?2,
                events = ?3,
                glimpses = ?4,
                glimpses_meta = ?5,
                subcalls = ?6,
                final = ?7,
                final_answer = ?8,
                citations = ?9,
                status = ?10,
                errors = ?11
             WHERE id = ?12",
        )
        .bind(serde_json::to_string(&update.program)?)
        .bind(serde_json::to_string(&update.meta)?)
        .bind(serde_json::to_string(&update.events)?)
        .bind(serde_json::to_string(&update.glimpses)?)
        .bind(serde_json::to_string(&update.glimpses_meta)?)
        .bind(serde_json::to_string(&update.subcalls)?)
        .bind(serde_json::to_string(&update.final_payload)?)
        .bind(&update.final_answer)
        .bind(serde_json::to_string(&update.citations)?)
        .bind(update.status.as_str())
        .bind(serde_json::to_string(&update.errors)?)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Appends one row to the external `rlm_run_events` log.
    pub async fn append_event(&self, run_id: &str, event: &Value) -> Result<(), RunStoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO rlm_run_events (run_id, event, created_at) VALUES (?1, ?2, ?3)")
            .bind(run_id)
            .bind(serde_json::to_string(event)?)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Legacy selective set/append path, used only by the assembly variant
    /// (§4.7, §9 open question).
    pub async fn update_run_patch(&self, run_id: &str, patch: &RunPatch) -> Result<(), RunStoreError> {
        if let Some(program) = &patch.program {
            sqlx::query("UPDATE rlm_runs SET program = ?1 WHERE id = ?2")
                .bind(serde_json::to_string(program)?)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(status) = &patch.status {
            sqlx::query("UPDATE rlm_runs SET status = ?1 WHERE id = ?2")
                .bind(status)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(events) = &patch.events {
            let row = sqlx::query("SELECT events FROM rlm_runs WHERE id = ?1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| RunStoreError::RunNotFound(run_id.to_string()))?;
            let existing: Vec<Value> = serde_json::from_str(&row.get::<String, _>("events"))?;
            let merged: Vec<Value> = existing.into_iter().chain(events.iter().cloned()).collect();
            sqlx::query("UPDATE rlm_runs SET events = ?1 WHERE id = ?2")
                .bind(serde_json::to_string(&merged)?)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(final_answer) = &patch.final_answer {
            sqlx::query("UPDATE rlm_runs SET final_answer = ?1 WHERE id = ?2")
                .bind(final_answer)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, RunStoreError> {
        let row = sqlx::query("SELECT * FROM rlm_runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RunStoreError::RunNotFound(run_id.to_string()))?;

        let status_str: String = row.get("status");
        let status = match status_str.as_str() {
            "ok" => RunStatus::Ok,
            "degraded" => RunStatus::Degraded,
            "error" => RunStatus::Error,
            _ => RunStatus::Stopped,
        };

        Ok(Run {
            id: row.get("id"),
            session_id: row.get("session_id"),
            query: row.get("query"),
            options: parse_col(&row, "options"),
            candidate_index: parse_col(&row, "candidate_index"),
            program: parse_col(&row, "program"),
            meta: parse_col(&row, "meta"),
            events: parse_list_col(&row, "events"),
            glimpses: parse_list_col(&row, "glimpses"),
            glimpses_meta: parse_list_col(&row, "glimpses_meta"),
            subcalls: parse_list_col(&row, "subcalls"),
            evidence: parse_list_col(&row, "evidence"),
            final_payload: parse_col(&row, "final"),
            final_answer: row.get("final_answer"),
            citations: parse_list_col(&row, "citations"),
            assembled_context: parse_col(&row, "assembled_context"),
            rendered_prompt: row.get("rendered_prompt"),
            llm_raw: parse_list_col(&row, "llm_raw"),
            errors: parse_list_col(&row, "errors"),
            status,
            created_at: row
                .get::<String, _>("created_at")
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub async fn list_events(&self, run_id: &str) -> Result<Vec<RunEventRow>, RunStoreError> {
        let rows = sqlx::query("SELECT id, run_id, event, created_at FROM rlm_run_events WHERE run_id = ?1 ORDER BY id ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RunEventRow {
                id: row.get("id"),
                run_id: row.get("run_id"),
                event: serde_json::from_str(&row.get::<String, _>("event")).unwrap_or(json!({})),
                created_at: row
                    .get::<String, _>("created_at")
                    .parse()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }
}

fn parse_col(row: &sqlx::sqlite::SqliteRow, col: &str) -> Value {
    row.try_get::<String, _>(col)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(json!({}))
}

fn parse_list_col(row: &sqlx::sqlite::SqliteRow, col: &str) -> Vec<Value> {
    row.try_get::<String, _>(col)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_pool() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE rlm_runs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                query TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '{}',
                candidate_index TEXT NOT NULL DEFAULT '{}',
                program TEXT NOT NULL DEFAULT '{}',
                meta TEXT NOT NULL DEFAULT '{}',
                events TEXT NOT NULL DEFAULT '[]',
                glimpses TEXT NOT NULL DEFAULT '[]',
                glimpses_meta TEXT NOT NULL DEFAULT '[]',
                subcalls TEXT NOT NULL DEFAULT '[]',
                evidence TEXT NOT NULL DEFAULT '[]',
                final TEXT NOT NULL DEFAULT '{}',
                final_answer TEXT,
                citations TEXT NOT NULL DEFAULT '[]',
                assembled_context TEXT NOT NULL DEFAULT '{}',
                rendered_prompt TEXT,
                llm_raw TEXT NOT NULL DEFAULT '[]',
                errors TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'ok',
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE rlm_run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_then_overwrite_is_consistent() {
        let pool = seed_pool().await;
        let store = RunStore::new(pool);
        let run_id = store
            .insert_run("s1", "what is this", &json!({}), &json!({}))
            .await
            .unwrap();

        let update = RunPayloadUpdate {
            program: json!({"steps": []}),
            status: RunStatus::Ok,
            final_answer: Some("hello".to_string()),
            ..Default::default()
        };
        store.update_run_payload(&run_id, &update).await.unwrap();

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.final_answer.as_deref(), Some("hello"));
        assert!(matches!(run.status, RunStatus::Ok));
    }

    #[tokio::test]
    async fn update_missing_run_is_an_error() {
        let pool = seed_pool().await;
        let store = RunStore::new(pool);
        let err = store
            .update_run_payload("missing", &RunPayloadUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::RunNotFound(_)));
    }
}
