//! Tolerant JSON extraction from root-LM chat responses (§4.4, §9).
//!
//! Three-stage fall-through: direct parse, strip fences and parse, greedy
//! `{...}` regex extraction. Callers always learn whether parsing actually
//! succeeded so they can branch to a degraded shell.

use serde_json::Value;
use std::sync::OnceLock;

pub struct TolerantParse {
    pub value: Option<Value>,
    pub parsed: bool,
}

fn brace_block_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?s)\{.*\}").unwrap())
}

/// Extracts the chat completion `content` string from an OpenAI-compatible
/// response body.
pub fn extract_message_content(response_body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(response_body).ok()?;
    json["choices"]
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Parses model-emitted JSON out of free text (§9 design note).
pub fn tolerant_parse(text: &str) -> TolerantParse {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return TolerantParse { value: Some(value), parsed: true };
    }

    let fenced = strip_code_fences(text);
    if fenced != text {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            return TolerantParse { value: Some(value), parsed: true };
        }
    }

    if let Some(m) = brace_block_pattern().find(text) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            return TolerantParse { value: Some(value), parsed: true };
        }
    }

    TolerantParse { value: None, parsed: false }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        text
    }
}
