//! Deterministic query tokenization for the retrieval service (§4.2).

use regex::Regex;
use std::sync::OnceLock;

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").unwrap())
}

fn cjk_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[一-鿿]+").unwrap())
}

/// Splits a camelCase word at lowercase/digit -> uppercase boundaries, e.g.
/// `fooBar` -> `["foo", "Bar"]`.
fn split_camel(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 {
            let prev = chars[i - 1];
            let boundary = (prev.is_ascii_lowercase() || prev.is_ascii_digit()) && c.is_ascii_uppercase();
            if boundary {
                parts.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts.into_iter().filter(|s| !s.is_empty()).collect()
}

fn word_tokens(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in word_pattern().find_iter(query) {
        for part in m.as_str().split('_') {
            if part.is_empty() {
                continue;
            }
            for seg in split_camel(part) {
                out.push(seg);
            }
        }
    }
    out
}

fn cjk_tokens(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in cjk_pattern().find_iter(query) {
        let run: Vec<char> = m.as_str().chars().collect();
        if run.len() <= 2 {
            out.push(run.into_iter().collect());
            continue;
        }
        for i in 0..run.len() - 1 {
            out.push(run[i..i + 2].iter().collect());
        }
    }
    out
}

/// Builds the deterministic token set used to score retrieval hits (§4.2).
///
/// Word runs are split on `_` and camelCase boundaries; CJK runs are
/// windowed into overlapping bigrams. Capped at `max_tokens`, falling back to
/// the trimmed query (or nothing) if no tokens were produced.
pub fn build_tokens(query: &str, max_tokens: usize) -> Vec<String> {
    let mut tokens = Vec::new();
    for token in word_tokens(query) {
        tokens.push(token);
        if tokens.len() >= max_tokens {
            return tokens;
        }
    }

    if tokens.len() < max_tokens {
        for token in cjk_tokens(query) {
            tokens.push(token);
            if tokens.len() >= max_tokens {
                break;
            }
        }
    }

    if tokens.is_empty() {
        let trimmed = query.trim();
        if !trimmed.is_empty() {
            tokens.push(trimmed.to_string());
        }
    }

    tokens.truncate(max_tokens);
    tokens
}

pub fn clamp_i64(value: i64, lo: i64, hi: i64) -> i64 {
    value.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_camel_case() {
        assert_eq!(split_camel("fooBarBaz"), vec!["foo", "Bar", "Baz"]);
    }

    #[test]
    fn splits_snake_case() {
        assert_eq!(word_tokens("foo_bar_baz"), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn caps_at_max_tokens() {
        let query = "a b c d e f g h i j k l m n o";
        let tokens = build_tokens(query, 12);
        assert_eq!(tokens.len(), 12);
    }

    #[test]
    fn falls_back_to_trimmed_query() {
        let tokens = build_tokens("  ", 12);
        assert!(tokens.is_empty());
    }

    #[test]
    fn cjk_runs_become_bigrams() {
        let tokens = cjk_tokens("上下文检索");
        assert_eq!(tokens, vec!["上下", "下文", "文检", "检索"]);
    }

    #[test]
    fn short_cjk_run_is_kept_whole() {
        let tokens = cjk_tokens("上下");
        assert_eq!(tokens, vec!["上下"]);
    }
}
