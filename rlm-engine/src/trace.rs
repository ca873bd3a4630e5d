//! Trace Logger (C8, §4.8): append-only per-run JSON-lines file, self
//! sufficient for replay without database access.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes `{trace_dir}/{run_id}.jsonl`, one JSON object per call, opened in
/// append mode and flushed immediately (§4.8).
pub struct TraceLogger {
    trace_dir: PathBuf,
}

impl TraceLogger {
    pub fn new(trace_dir: impl Into<PathBuf>) -> Self {
        Self { trace_dir: trace_dir.into() }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.trace_dir.join(format!("{run_id}.jsonl"))
    }

    /// Appends one trace line. `stage` is one of `plan|examine|decision|error`.
    pub fn emit(&self, run_id: &str, stage: &str, payload: &Value, meta: &Value) -> Result<(), TraceError> {
        std::fs::create_dir_all(&self.trace_dir)?;
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": run_id,
            "stage": stage,
            "payload": payload,
            "meta": meta,
        });
        let mut file = OpenOptions::new().create(true).append(true).open(self.path_for(run_id))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        file.flush()?;
        Ok(())
    }

    /// Reads a trace file line by line, pretty-printing each as
    /// `"{ts} {stage} {summary}"`.
    pub fn replay(&self, run_id: &str) -> Result<Vec<String>, TraceError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)?;
            lines.push(format_trace_line(&value));
        }
        Ok(lines)
    }

    pub fn trace_path(&self, run_id: &str) -> PathBuf {
        self.path_for(run_id)
    }
}

fn format_trace_line(value: &Value) -> String {
    let ts = value.get("ts").and_then(|v| v.as_str()).unwrap_or("?");
    let stage = value.get("stage").and_then(|v| v.as_str()).unwrap_or("?");
    let summary = summarize_payload(stage, value.get("payload").unwrap_or(&Value::Null));
    format!("{ts} {stage} {summary}")
}

/// Human-readable distillation per §4.6: counts for examine, preview for
/// decision, the error string for error, else the raw payload.
fn summarize_payload(stage: &str, payload: &Value) -> String {
    match stage {
        "examine" => format!(
            "events={} glimpses={} subcalls={} status={}",
            payload.get("events_count").and_then(|v| v.as_i64()).unwrap_or(0),
            payload.get("glimpses_count").and_then(|v| v.as_i64()).unwrap_or(0),
            payload.get("subcalls_count").and_then(|v| v.as_i64()).unwrap_or(0),
            payload.get("executor_status").and_then(|v| v.as_str()).unwrap_or("?"),
        ),
        "decision" => format!(
            "citations={} preview={}",
            payload.get("citations_count").and_then(|v| v.as_i64()).unwrap_or(0),
            payload.get("final_answer_preview").and_then(|v| v.as_str()).unwrap_or(""),
        ),
        "error" => payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string(),
        _ => payload.to_string(),
    }
}

/// First 120 chars of `text`, newlines collapsed to spaces (§4.6 decision trace).
pub fn preview_120(text: &str) -> String {
    let collapsed: String = text.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    collapsed.chars().take(120).collect()
}

pub fn is_run_traced(trace_dir: &Path, run_id: &str) -> bool {
    trace_dir.join(format!("{run_id}.jsonl")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn emit_then_replay_round_trips_one_line() {
        let dir = tempdir().unwrap();
        let logger = TraceLogger::new(dir.path());
        logger.emit("run-1", "plan", &json!({"steps": 2}), &json!({})).unwrap();

        let lines = logger.replay("run-1").unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("plan"));
    }

    #[test]
    fn replay_of_unknown_run_is_empty_not_an_error() {
        let dir = tempdir().unwrap();
        let logger = TraceLogger::new(dir.path());
        assert!(logger.replay("missing").unwrap().is_empty());
    }

    #[test]
    fn preview_120_collapses_newlines_and_truncates() {
        let text = "a\nb\n".to_string() + &"x".repeat(200);
        let preview = preview_120(&text);
        assert_eq!(preview.len(), 120);
        assert!(!preview.contains('\n'));
    }

    #[test]
    fn examine_stage_summary_includes_counts() {
        let dir = tempdir().unwrap();
        let logger = TraceLogger::new(dir.path());
        logger
            .emit(
                "run-2",
                "examine",
                &json!({"events_count": 3, "glimpses_count": 1, "subcalls_count": 0, "executor_status": "ok"}),
                &json!({}),
            )
            .unwrap();
        let lines = logger.replay("run-2").unwrap();
        assert!(lines[0].contains("events=3"));
    }
}
