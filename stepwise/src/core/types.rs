//! Step- and plan-level results.
//!
//! These are the stable output contracts of an execution; they serialize into the
//! run log and the CLI output unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Outcome of one step (after retries).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    /// Explicit result value (Code result, Api body, Decision branch, Loop count).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
    /// Dry-run: the step was simulated, nothing was changed.
    #[serde(default)]
    pub simulated: bool,
}

impl ExecutionResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            attempts: 1,
            ..Self::default()
        }
    }

    /// Common keys published under `result.<step>`.
    pub fn meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("success".to_string(), json!(self.success));
        meta.insert("error".to_string(), json!(self.error));
        meta.insert("duration_ms".to_string(), json!(self.duration_ms));
        meta.insert("attempts".to_string(), json!(self.attempts));
        meta.insert("simulated".to_string(), json!(self.simulated));
        meta
    }
}

/// Outcome of a whole plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_id: String,
    pub success: bool,
    /// Realized path: completed steps in completion order, loop bodies once per
    /// iteration.
    pub executed: Vec<String>,
    /// Pruned branches and steps skipped after failure.
    pub skipped: Vec<String>,
    /// Keyed by step id; loop body runs use `<id>[<iteration>]`.
    pub step_results: BTreeMap<String, ExecutionResult>,
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl PlanResult {
    /// Position of `step` in the realized path.
    pub fn position(&self, step: &str) -> Option<usize> {
        self.executed.iter().position(|id| id == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_carries_common_keys() {
        let mut result = ExecutionResult::succeeded();
        result.duration_ms = 12;
        let meta = result.meta();
        assert_eq!(meta["success"], json!(true));
        assert_eq!(meta["error"], Value::Null);
        assert_eq!(meta["attempts"], json!(1));
        assert_eq!(meta["duration_ms"], json!(12));
    }
}
