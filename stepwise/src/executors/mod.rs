//! Per-kind step handlers.
//!
//! A handler turns one step's parameters into a [`StepOutput`] or a
//! [`StepFailure`]. Parameters are resolved against the variable store inside
//! the handler, field by field, so a handler only ever sees the templates it
//! needs. Handlers never decide retry, skip or abort; the scheduler does that
//! through the recovery policy.
//!
//! Loop steps have no handler: the scheduler drives their body sub-graph.

pub mod api;
pub mod code;
pub mod command;
pub mod decision;
pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::types::ExecutionResult;
use crate::core::variables::VariableStore;
use crate::error::{ResolveError, StepError};
use crate::io::config::EngineConfig;
use crate::io::http::{HttpTransport, UreqTransport};
use crate::io::oplog::Journal;
use crate::plan::{
    ApiParams, CodeParams, CommandParams, DecisionParams, FileParams, PlanStep, StepAction,
};

/// Everything a handler may use while running one attempt of a step.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub step: &'a PlanStep,
    pub store: &'a VariableStore,
    /// Absolute directory relative paths and processes are anchored to.
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub dry_run: bool,
    /// Open transaction of the run; `None` in dry-run mode.
    pub journal: Option<Journal<'a>>,
}

impl ExecContext<'_> {
    /// Anchor `raw` at the working directory unless it is already absolute.
    pub fn path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

/// Successful attempt: the result plus the kind-specific fields published
/// under `result.<step>` and `<step>_<field>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub result: ExecutionResult,
    pub fields: Map<String, Value>,
    /// Selected branch of a Decision.
    pub branch: Option<bool>,
}

impl StepOutput {
    pub fn success() -> Self {
        Self {
            result: ExecutionResult::succeeded(),
            ..Self::default()
        }
    }

    /// Dry-run stand-in for a step that would have changed something.
    pub fn simulated() -> Self {
        let mut output = Self::success();
        output.result.simulated = true;
        output
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Failed attempt. `partial` carries whatever output was captured before the
/// failure (a command's stderr, an HTTP error body).
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: StepError,
    pub partial: Option<StepOutput>,
}

impl StepFailure {
    pub fn with_output(error: StepError, partial: StepOutput) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl From<StepError> for StepFailure {
    fn from(error: StepError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

impl From<ResolveError> for StepFailure {
    fn from(error: ResolveError) -> Self {
        StepError::from(error).into()
    }
}

pub type StepAttempt = Result<StepOutput, StepFailure>;

/// Handler for one step kind.
pub trait Handler<P>: Send + Sync {
    fn run(&self, params: &P, ctx: &ExecContext<'_>) -> StepAttempt;
}

/// One handler per executable step kind, dispatched once per attempt.
pub struct HandlerTable {
    pub command: Box<dyn Handler<CommandParams>>,
    pub code: Box<dyn Handler<CodeParams>>,
    pub file: Box<dyn Handler<FileParams>>,
    pub api: Box<dyn Handler<ApiParams>>,
    pub decision: Box<dyn Handler<DecisionParams>>,
}

impl HandlerTable {
    /// Process, filesystem and ureq-backed handlers configured from `config`.
    pub fn standard(config: &EngineConfig) -> Self {
        Self::with_transport(config, Box::new(UreqTransport::new(&config.http.user_agent)))
    }

    pub fn with_transport(config: &EngineConfig, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            command: Box::new(command::CommandHandler::new(config.output_limit_bytes)),
            code: Box::new(code::CodeHandler::new(&config.code, config.output_limit_bytes)),
            file: Box::new(file::FileHandler),
            api: Box::new(api::ApiHandler::new(transport)),
            decision: Box::new(decision::DecisionHandler),
        }
    }

    pub fn dispatch(&self, action: &StepAction, ctx: &ExecContext<'_>) -> StepAttempt {
        match action {
            StepAction::Command(params) => self.command.run(params, ctx),
            StepAction::Code(params) => self.code.run(params, ctx),
            StepAction::File(params) => self.file.run(params, ctx),
            StepAction::Api(params) => self.api.run(params, ctx),
            StepAction::Decision(params) => self.decision.run(params, ctx),
            StepAction::Loop(_) => Err(StepError::InvalidParams(
                "loop steps are driven by the scheduler".to_string(),
            )
            .into()),
        }
    }
}

/// Last non-empty line of `text`, trimmed.
pub(crate) fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// Publish the captured streams of a process on `output`.
pub(crate) fn with_streams(
    mut output: StepOutput,
    stdout: String,
    stderr: String,
    return_code: Option<i32>,
) -> StepOutput {
    output = output
        .field("stdout", stdout.clone())
        .field("stderr", stderr.clone())
        .field("return_code", return_code);
    output.result.stdout = Some(stdout);
    output.result.stderr = Some(stderr);
    output.result.return_code = return_code;
    output
}
