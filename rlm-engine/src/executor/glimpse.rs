//! Glimpse extraction modes for the `glimpse` program action (§4.5).
//!
//! Note: this is substring/window-based grep, distinct from the
//! line-oriented `GREP` REPL command in §4.5a.

use rlm_core::models::{Candidate, CandidateIndex, GlimpseSpan};
use serde_json::{json, Value};

pub struct Extracted {
    pub text: String,
    pub span: GlimpseSpan,
}

/// `head{n}`: first `min(n, max_glimpse_chars)` chars.
pub fn extract_head(text: &str, n: i64, max_glimpse_chars: i64) -> Extracted {
    let chars: Vec<char> = text.chars().collect();
    let take = n.min(max_glimpse_chars).max(0) as usize;
    let take = take.min(chars.len());
    Extracted {
        text: chars[..take].iter().collect(),
        span: GlimpseSpan::Single { start: 0, end: take },
    }
}

/// `range{start,end}`: clamped, swapped if `end < start`.
pub fn extract_range(text: &str, start: i64, end: i64) -> Extracted {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let mut start = start.clamp(0, len);
    let mut end = if end <= 0 || end > len { len } else { end };
    if end < start {
        std::mem::swap(&mut start, &mut end);
    }
    let (s, e) = (start as usize, end as usize);
    Extracted {
        text: chars[s..e].iter().collect(),
        span: GlimpseSpan::Single { start: s, end: e },
    }
}

/// `grep{pattern, window, max_hits}`: substring matches, windowed, joined
/// with `"\n...\n"`.
pub fn extract_grep(text: &str, pattern: &str, window: i64, max_hits: i64) -> Extracted {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let window = window.max(0);
    let max_hits = max_hits.max(0) as usize;

    if pattern.is_empty() {
        return Extracted { text: String::new(), span: GlimpseSpan::Multi { spans: vec![] } };
    }

    let haystack: String = chars.iter().collect();
    let pattern_len = pattern.chars().count() as i64;

    let mut excerpts = Vec::new();
    let mut spans = Vec::new();
    let mut search_from = 0usize;
    while excerpts.len() < max_hits {
        let Some(byte_idx) = haystack[char_to_byte(&haystack, search_from)..].find(pattern) else {
            break;
        };
        let idx = byte_to_char(&haystack, char_to_byte(&haystack, search_from) + byte_idx);
        let start = (idx as i64 - window).max(0);
        let end = ((idx as i64 + pattern_len + window).min(len)).max(0);
        let (s, e) = (start as usize, end as usize);
        excerpts.push(chars[s..e].iter().collect::<String>());
        spans.push((s, e));
        search_from = idx + 1;
        if search_from >= chars.len() {
            break;
        }
    }

    Extracted {
        text: excerpts.join("\n...\n"),
        span: GlimpseSpan::Multi { spans },
    }
}

/// Line-oriented grep for the REPL's `GREP` command (§4.5a), distinct from
/// the substring/window `grep` mode above: each matching line is emitted as
/// `"{1-based line number}:{line}"`, capped at `max_lines`.
pub fn extract_grep_lines(text: &str, pattern: &str, max_lines: i64) -> String {
    if pattern.is_empty() {
        return String::new();
    }
    let max_lines = max_lines.max(0) as usize;
    text.lines()
        .enumerate()
        .filter(|(_, line)| line.contains(pattern))
        .take(max_lines)
        .map(|(i, line)| format!("{}:{}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map(|(b, _)| b).unwrap_or(s.len())
}

fn byte_to_char(s: &str, byte_idx: usize) -> usize {
    s[..byte_idx].chars().count()
}

/// Top-K fallback used by `deterministic_fallback` (§4.5 outcome mapping,
/// §4.5a `LIST_ARTIFACTS`-style ordering): `(pinned, weight, hit_count,
/// base_score)` desc.
pub fn deterministic_fallback(index: &CandidateIndex, top_k: i64) -> Value {
    let top_k = top_k.clamp(1, 200) as usize;
    let mut candidates: Vec<&Candidate> = index.candidates.iter().collect();
    candidates.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then(b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal))
            .then(
                b.score_breakdown
                    .hit_count
                    .partial_cmp(&a.score_breakdown.hit_count)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.base_score.partial_cmp(&a.base_score).unwrap_or(std::cmp::Ordering::Equal))
    });
    let selected: Vec<&Candidate> = candidates.into_iter().take(top_k).collect();
    let selected_ids: Vec<&str> = selected.iter().map(|c| c.artifact_id.as_str()).collect();

    json!({
        "mode": "fallback",
        "selected_ids": selected_ids,
        "selected": selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_clamps_to_max_glimpse_chars() {
        let extracted = extract_head("0123456789", 100, 5);
        assert_eq!(extracted.text, "01234");
    }

    #[test]
    fn range_swaps_reversed_bounds() {
        let extracted = extract_range("0123456789", 8, 2);
        assert_eq!(extracted.text, "234567");
    }

    #[test]
    fn range_clamps_end_past_length() {
        let extracted = extract_range("abc", 0, 999);
        assert_eq!(extracted.text, "abc");
    }

    #[test]
    fn grep_windows_and_caps_hits() {
        let text = "the quick fox jumps over the lazy fox near the river";
        let extracted = extract_grep(text, "fox", 3, 1);
        assert!(extracted.text.contains("fox"));
        if let GlimpseSpan::Multi { spans } = extracted.span {
            assert_eq!(spans.len(), 1);
        } else {
            panic!("expected multi span");
        }
    }

    #[test]
    fn grep_joins_multiple_hits_with_separator() {
        let text = "fox one fox two fox three";
        let extracted = extract_grep(text, "fox", 2, 3);
        assert!(extracted.text.contains("\n...\n"));
    }

    #[test]
    fn grep_lines_prefixes_with_1_based_line_numbers() {
        let text = "alpha\nfox here\nbeta\nanother fox";
        let result = extract_grep_lines(text, "fox", 10);
        assert_eq!(result, "2:fox here\n4:another fox");
    }

    #[test]
    fn grep_lines_caps_at_max_lines() {
        let text = "fox\nfox\nfox";
        let result = extract_grep_lines(text, "fox", 2);
        assert_eq!(result.lines().count(), 2);
    }
}
