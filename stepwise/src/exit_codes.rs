//! Stable exit codes for stepwise CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid plan, config or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `stepwise run` executed the plan and a step aborted it.
pub const PLAN_FAILED: i32 = 2;
/// `stepwise rollback` left operations applied (halted, or non-reversible commands).
pub const PARTIAL_ROLLBACK: i32 = 3;
