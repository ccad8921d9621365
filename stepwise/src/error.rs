//! Typed error taxonomy for plan validation, resolution, step execution and rollback.
//!
//! Plumbing (I/O, config, CLI) uses `anyhow`; these types exist where callers branch on
//! the failure kind. They travel inside `anyhow::Error` and are recovered with
//! `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

use crate::io::rollback::TransactionRollback;

/// Plan rejected before any step ran.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph (with implicit branch and loop edges) has a cycle.
    #[error("plan contains a dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("invalid plan:\n- {}", .errors.join("\n- "))]
    Invalid { errors: Vec<String> },
}

/// A `${...}` reference could not be parsed or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unresolved variable '${{{path}}}': {reason}")]
    Unresolved { path: String, reason: String },
    #[error("invalid variable reference '{reference}': {reason}")]
    Syntax { reference: String, reason: String },
}

/// Failure of a single step attempt.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Resolution(#[from] ResolveError),
    #[error("{message}")]
    Execution { message: String, retryable: bool },
    #[error("step timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl StepError {
    /// Failure that may succeed when attempted again (process exit, I/O, network).
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that a retry cannot fix (bad input, rejected status).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution(_) | Self::InvalidParams(_) => false,
            Self::Execution { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
        }
    }
}

/// Rollback could not invert an operation.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("operation {record_id} not found")]
    UnknownRecord { record_id: String },
    #[error("transaction {transaction_id} not found")]
    UnknownTransaction { transaction_id: String },
    #[error("no transaction to roll back")]
    NothingToRollBack,
    #[error("operation {record_id} is already rolled back")]
    AlreadyRolledBack { record_id: String },
    #[error("{path} changed since operation {record_id}; refusing to overwrite")]
    Drifted { record_id: String, path: String },
    #[error("compensating command for operation {record_id} failed: {message}")]
    CompensationFailed { record_id: String, message: String },
    #[error("restore for operation {record_id} failed: {message}")]
    Restore { record_id: String, message: String },
    /// Transaction rollback stopped at the first failed inversion.
    #[error(
        "rollback of {} halted: {source}; {} operation(s) remain applied",
        .report.transaction_id,
        .report.remaining.len()
    )]
    Halted {
        report: Box<TransactionRollback>,
        source: Box<RollbackError>,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
