//! Decision steps: evaluate a condition and select a branch.

use serde_json::Value;
use tracing::{debug, instrument};

use super::{ExecContext, Handler, StepAttempt, StepOutput};
use crate::plan::DecisionParams;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionHandler;

impl Handler<DecisionParams> for DecisionHandler {
    #[instrument(skip_all, fields(step_id = %ctx.step.id))]
    fn run(&self, params: &DecisionParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let exists = |raw: &str| ctx.path(raw).exists();
        let branch = params.condition.evaluate(ctx.store, &exists)?;
        let selected = if branch {
            &params.if_true
        } else {
            &params.if_false
        };
        debug!(branch, ?selected, "condition evaluated");

        let mut out = StepOutput::success()
            .field("branch", branch)
            .field("selected", selected.clone())
            .field(
                "condition",
                serde_json::to_value(&params.condition).unwrap_or(Value::Null),
            );
        out.result.value = Some(Value::Bool(branch));
        out.branch = Some(branch);
        Ok(out)
    }
}
