//! Glimpse cache key construction (§4.3).

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Redis key patterns for glimpse cache entries.
pub struct GlimpseKeyPatterns;

impl GlimpseKeyPatterns {
    /// `rlm:glimpse:{run_id}:{glimpse_id}`
    pub fn glimpse(run_id: &str, glimpse_id: &str) -> String {
        format!("rlm:glimpse:{run_id}:{glimpse_id}")
    }
}

/// `glimpse_id = SHA256(json_canonical({artifact_id, content_hash, spec}))`.
///
/// Canonical here means key-sorted JSON so the hash is a pure function of
/// the semantic inputs, never of field insertion order.
pub fn glimpse_id(artifact_id: &str, content_hash: &str, spec: &Value) -> String {
    let mut canonical: BTreeMap<&str, Value> = BTreeMap::new();
    canonical.insert("artifact_id", Value::String(artifact_id.to_string()));
    canonical.insert("content_hash", Value::String(content_hash.to_string()));
    canonical.insert("spec", spec.clone());

    let bytes = serde_json::to_vec(&canonical).expect("canonical glimpse key is always serializable");
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_inputs_yield_same_id() {
        let spec = json!({"mode": "head", "n": 800});
        let a = glimpse_id("artifact-1", "hash-1", &spec);
        let b = glimpse_id("artifact-1", "hash-1", &spec);
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_hash_yields_different_id() {
        let spec = json!({"mode": "head", "n": 800});
        let a = glimpse_id("artifact-1", "hash-1", &spec);
        let b = glimpse_id("artifact-1", "hash-2", &spec);
        assert_ne!(a, b);
    }

    #[test]
    fn key_pattern_matches_spec() {
        assert_eq!(
            GlimpseKeyPatterns::glimpse("run-1", "abc"),
            "rlm:glimpse:run-1:abc"
        );
    }
}
