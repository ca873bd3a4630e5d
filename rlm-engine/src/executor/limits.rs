//! Program Executor limits (§4.5): clamped, each strictly positive.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

fn clamp_positive(value: i64, default: i64) -> i64 {
    if value > 0 {
        value
    } else {
        default
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub max_steps: i64,
    pub max_subcalls: i64,
    pub max_depth: i64,
    pub max_program_chars: i64,
    pub max_event_errors: i64,
    pub max_glimpse_chars: i64,
    pub max_grep_hits: i64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 32,
            max_subcalls: 24,
            max_depth: 4,
            max_program_chars: 20_000,
            max_event_errors: 2,
            max_glimpse_chars: 2000,
            max_grep_hits: 5,
        }
    }
}

impl ExecutionLimits {
    /// Assembly-mode default is 16 steps where the Examine round uses 32
    /// (§4.6a: same clamped-int snapshot, different defaults per caller).
    pub fn assembly_default() -> Self {
        Self { max_steps: 16, ..Self::default() }
    }

    /// Merges caller-supplied overrides (from `options.limits`) over the
    /// given defaults, clamping every field to be strictly positive.
    pub fn from_overrides(defaults: &ExecutionLimits, overrides: &Value) -> Self {
        let mut limits = defaults.clone();
        if let Some(v) = overrides.get("max_steps").and_then(|v| v.as_i64()) {
            limits.max_steps = clamp_positive(v, defaults.max_steps);
        }
        if let Some(v) = overrides.get("max_subcalls").and_then(|v| v.as_i64()) {
            limits.max_subcalls = clamp_positive(v, defaults.max_subcalls);
        }
        if let Some(v) = overrides.get("max_depth").and_then(|v| v.as_i64()) {
            limits.max_depth = clamp_positive(v, defaults.max_depth);
        }
        if let Some(v) = overrides.get("max_program_chars").and_then(|v| v.as_i64()) {
            limits.max_program_chars = clamp_positive(v, defaults.max_program_chars);
        }
        if let Some(v) = overrides.get("max_event_errors").and_then(|v| v.as_i64()) {
            limits.max_event_errors = clamp_positive(v, defaults.max_event_errors);
        }
        limits
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "max_steps": self.max_steps,
            "max_subcalls": self.max_subcalls,
            "max_depth": self.max_depth,
            "max_program_chars": self.max_program_chars,
            "max_event_errors": self.max_event_errors,
            "max_glimpse_chars": self.max_glimpse_chars,
            "max_grep_hits": self.max_grep_hits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_default_uses_16_steps() {
        assert_eq!(ExecutionLimits::assembly_default().max_steps, 16);
        assert_eq!(ExecutionLimits::default().max_steps, 32);
    }

    #[test]
    fn overrides_below_zero_are_rejected_in_favor_of_defaults() {
        let defaults = ExecutionLimits::default();
        let limits = ExecutionLimits::from_overrides(&defaults, &json!({"max_steps": -5}));
        assert_eq!(limits.max_steps, defaults.max_steps);
    }

    #[test]
    fn overrides_apply_when_positive() {
        let defaults = ExecutionLimits::default();
        let limits = ExecutionLimits::from_overrides(&defaults, &json!({"max_steps": 8}));
        assert_eq!(limits.max_steps, 8);
    }
}
