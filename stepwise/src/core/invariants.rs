//! Semantic invariants not expressible via JSON Schema.

use std::collections::BTreeSet;

use crate::core::graph::ExecutionGraph;
use crate::core::resolve::references;
use crate::error::PlanError;
use crate::plan::{FailureStrategy, LoopSource, PlanStep, StepAction, TaskPlan};

/// Accept a plan: build its graph, then check per-step invariants.
///
/// Graph problems (unknown dependency, cycle) are reported as their own
/// [`PlanError`] variants; everything else is collected into `Invalid`.
pub fn validate_plan(plan: &TaskPlan) -> Result<ExecutionGraph, PlanError> {
    let graph = ExecutionGraph::build(plan)?;
    let mut errors = validate_invariants(plan);

    if let Some(declared) = &plan.entry_points {
        let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
        let derived: BTreeSet<&str> = graph.entry_points().into_iter().collect();
        if declared != derived {
            errors.push(format!(
                "entry_points {:?} do not match steps without dependencies {:?}",
                declared, derived
            ));
        }
    }

    if errors.is_empty() {
        Ok(graph)
    } else {
        Err(PlanError::Invalid { errors })
    }
}

/// Check per-step invariants:
/// - ids are non-empty and use `[A-Za-z0-9_-]`
/// - `${...}` references in parameters parse
/// - decision conditions belong to the closed grammar and name existing steps
/// - `on_failure = skip` only on optional steps
/// - loops have a body and a usable range
pub fn validate_invariants(plan: &TaskPlan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.id.trim().is_empty() {
        errors.push("plan id must be non-empty".to_string());
    }
    if plan.steps.is_empty() {
        errors.push("plan has no steps".to_string());
    }
    for step in plan.steps.values() {
        validate_step(plan, step, &mut errors);
    }
    errors
}

fn validate_step(plan: &TaskPlan, step: &PlanStep, errors: &mut Vec<String>) {
    let id = step.id.as_str();
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push(format!(
            "step id '{id}' must be non-empty and use only letters, digits, '_' or '-'"
        ));
    }

    for template in step.action.templates() {
        if let Err(err) = references(template) {
            errors.push(format!("{id}: {err}"));
        }
    }

    if step.on_failure == Some(FailureStrategy::Skip) && !step.optional {
        errors.push(format!("{id}: on_failure=skip requires optional=true"));
    }
    if step.timeout_secs == Some(0) {
        errors.push(format!("{id}: timeout_secs must be > 0"));
    }
    if step.retry.multiplier < 1.0 {
        errors.push(format!("{id}: retry.multiplier must be >= 1"));
    }

    match &step.action {
        StepAction::Decision(params) => {
            for err in params.condition.check() {
                errors.push(format!("{id}: {err}"));
            }
            for referenced in params.condition.referenced_steps() {
                if !plan.steps.contains_key(referenced) {
                    errors.push(format!("{id}: condition references unknown step '{referenced}'"));
                }
            }
        }
        StepAction::Loop(params) => {
            if params.body.is_empty() {
                errors.push(format!("{id}: loop body must not be empty"));
            }
            if let LoopSource::Range { step: 0, .. } = params.items {
                errors.push(format!("{id}: range step must not be 0"));
            }
        }
        StepAction::Command(params) => {
            if params.command.trim().is_empty() {
                errors.push(format!("{id}: command must be non-empty"));
            }
        }
        StepAction::Api(params) => {
            if params.url.trim().is_empty() {
                errors.push(format!("{id}: url must be non-empty"));
            }
        }
        StepAction::Code(_) | StepAction::File(_) => {}
    }
}
