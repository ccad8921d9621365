//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::graph::ExecutionGraph;
use crate::core::invariants::validate_plan;
use crate::plan::{PlanDocument, TaskPlan};

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));

/// Load a plan from disk and check its shape (schema + param types).
///
/// Graph validation happens when the plan is executed or via [`validate_plan_file`].
pub fn load_plan(path: &Path) -> Result<TaskPlan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Parse a plan document: JSON, then schema, then typed parameters.
pub fn parse_plan(contents: &str) -> Result<TaskPlan> {
    let value: Value = serde_json::from_str(contents).context("parse plan json")?;
    validate_schema(&value)?;
    let doc: PlanDocument = serde_json::from_value(value).context("deserialize plan")?;
    let plan = TaskPlan::try_from(doc)?;
    Ok(plan)
}

/// Load and fully validate a plan (schema, params, graph, invariants).
pub fn validate_plan_file(path: &Path) -> Result<(TaskPlan, ExecutionGraph)> {
    let plan = load_plan(path)?;
    let graph = validate_plan(&plan)?;
    Ok((plan, graph))
}

/// Write a plan with stable formatting.
pub fn write_plan(path: &Path, plan: &TaskPlan) -> Result<()> {
    super::write_json(path, plan)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
