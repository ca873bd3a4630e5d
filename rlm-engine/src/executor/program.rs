//! Program shape and pre-execution checks (§4.5).

use serde_json::Value;

use crate::error::ExecutorError;
use crate::executor::limits::ExecutionLimits;

/// Recognized step actions (§3). Any other action fails that step at
/// execution time, not at precheck time.
pub const RECOGNIZED_ACTIONS: &[&str] = &["noop", "select", "glimpse", "repl"];

pub fn estimate_program_chars(program: &Value) -> usize {
    serde_json::to_string(program).map(|s| s.chars().count()).unwrap_or(usize::MAX)
}

fn steps_of(program: &Value) -> Option<&Vec<Value>> {
    program.get("steps").and_then(|v| v.as_array())
}

/// Recursive walk counting steps/subcalls/depth, raising the first limit
/// breach or a parse-shape failure (§4.5 pre-execution checks).
pub fn check_limits(program: &Value, limits: &ExecutionLimits) -> Result<(), ExecutorError> {
    let chars = estimate_program_chars(program);
    if chars as i64 > limits.max_program_chars {
        return Err(ExecutorError::LimitExceeded { limit: "max_program_chars".to_string() });
    }

    let top_steps = steps_of(program)
        .ok_or_else(|| ExecutorError::ProgramParseFailed("missing or non-array `steps`".to_string()))?;

    let mut step_count = 0i64;
    let mut subcall_count = 0i64;
    walk(top_steps, limits, 1, &mut step_count, &mut subcall_count)
}

fn walk(
    steps: &[Value],
    limits: &ExecutionLimits,
    depth: i64,
    step_count: &mut i64,
    subcall_count: &mut i64,
) -> Result<(), ExecutorError> {
    if depth > limits.max_depth {
        return Err(ExecutorError::LimitExceeded { limit: "max_depth".to_string() });
    }

    for step in steps {
        let action = step
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecutorError::ProgramParseFailed("step missing `action`".to_string()))?;
        if !RECOGNIZED_ACTIONS.contains(&action) {
            return Err(ExecutorError::ProgramParseFailed(format!("unrecognized action `{action}`")));
        }

        *step_count += 1;
        if *step_count > limits.max_steps {
            return Err(ExecutorError::LimitExceeded { limit: "max_steps".to_string() });
        }

        if let Some(subcalls) = step.get("subcalls").and_then(|v| v.as_array()) {
            *subcall_count += subcalls.len() as i64;
            if *subcall_count > limits.max_subcalls {
                return Err(ExecutorError::LimitExceeded { limit: "max_subcalls".to_string() });
            }
            walk(subcalls, limits, depth + 1, step_count, subcall_count)?;
        }
    }

    Ok(())
}
