//! Code steps: a snippet run by a configured interpreter.
//!
//! The snippet sees a read-only JSON snapshot of the variable store (path in
//! `STEPWISE_VARS`) and reports its result through `STEPWISE_RESULT`. Python
//! snippets get the snapshot as `variables` and a `result` global that is
//! serialized automatically. Shell snippets write JSON (or plain text) to
//! `"$STEPWISE_RESULT"` themselves.
//!
//! This is not a sandbox. The only restriction is the closed set of languages:
//! Python snippets run with full builtins, and every snippet runs as a child
//! process with the engine's own user, environment, filesystem and network
//! access. Only run plans from trusted producers.

use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tracing::{debug, instrument};

use super::{ExecContext, Handler, StepAttempt, StepFailure, StepOutput, last_line, with_streams};
use crate::error::StepError;
use crate::io::config::CodeConfig;
use crate::io::process::run_command_with_timeout;
use crate::plan::{CodeLanguage, CodeParams};

const PYTHON_WRAPPER: &str = r#"import json
import os
import sys

with open(os.environ["STEPWISE_VARS"], encoding="utf-8") as handle:
    _variables = json.load(handle)
with open(sys.argv[1], encoding="utf-8") as handle:
    _source = handle.read()
_namespace = {"__name__": "__stepwise__", "variables": _variables, "result": None}
exec(compile(_source, "<snippet>", "exec"), _namespace)
with open(os.environ["STEPWISE_RESULT"], "w", encoding="utf-8") as handle:
    json.dump(_namespace.get("result"), handle, default=str)
"#;

#[derive(Debug, Clone)]
pub struct CodeHandler {
    python: Vec<String>,
    shell: Vec<String>,
    output_limit_bytes: usize,
}

impl CodeHandler {
    pub fn new(config: &CodeConfig, output_limit_bytes: usize) -> Self {
        Self {
            python: config.python.clone(),
            shell: config.shell.clone(),
            output_limit_bytes,
        }
    }

    fn interpreter(&self, language: CodeLanguage) -> Result<Command, StepError> {
        let argv = match language {
            CodeLanguage::Python => &self.python,
            CodeLanguage::Shell => &self.shell,
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StepError::InvalidParams("no interpreter configured".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl Handler<CodeParams> for CodeHandler {
    #[instrument(skip_all, fields(step_id = %ctx.step.id, language = ?params.language))]
    fn run(&self, params: &CodeParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let scratch = tempfile::tempdir()
            .map_err(|err| StepError::execution(format!("create snippet dir: {err}")))?;
        let vars_path = scratch.path().join("vars.json");
        let result_path = scratch.path().join("result.json");
        let snapshot = serde_json::to_string(&ctx.store.snapshot())
            .map_err(|err| StepError::permanent(format!("serialize variables: {err}")))?;
        write_scratch(&vars_path, &snapshot)?;

        let mut cmd = self.interpreter(params.language)?;
        match params.language {
            CodeLanguage::Python => {
                let wrapper = scratch.path().join("wrapper.py");
                let snippet = scratch.path().join("snippet.py");
                write_scratch(&wrapper, PYTHON_WRAPPER)?;
                write_scratch(&snippet, &params.source)?;
                cmd.arg(&wrapper).arg(&snippet);
            }
            CodeLanguage::Shell => {
                let snippet = scratch.path().join("snippet.sh");
                write_scratch(&snippet, &params.source)?;
                cmd.arg(&snippet);
            }
        }
        cmd.current_dir(ctx.workdir)
            .env("STEPWISE_VARS", &vars_path)
            .env("STEPWISE_RESULT", &result_path);

        let output = run_command_with_timeout(cmd, None, ctx.timeout, self.output_limit_bytes)
            .map_err(|err| StepError::execution(format!("start interpreter: {err:#}")))?;
        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        let code = output.status.code();
        let reason = last_line(&stderr).map(str::to_string);

        if output.timed_out {
            let out = with_streams(StepOutput::success(), stdout, stderr, code);
            return Err(StepFailure::with_output(
                StepError::Timeout { after: ctx.timeout },
                out,
            ));
        }
        if !output.status.success() {
            let out = with_streams(StepOutput::success(), stdout, stderr, code)
                .field("result", Value::Null);
            let message = reason.unwrap_or_else(|| format!("snippet exited with {code:?}"));
            return Err(StepFailure::with_output(StepError::execution(message), out));
        }

        let result = read_result(&result_path);
        debug!(result_type = crate::core::resolve::type_name(&result), "snippet finished");
        let mut out = with_streams(StepOutput::success(), stdout, stderr, code)
            .field("result", result.clone());
        out.result.value = Some(result);
        Ok(out)
    }
}

fn write_scratch(path: &Path, contents: &str) -> Result<(), StepError> {
    fs::write(path, contents)
        .map_err(|err| StepError::execution(format!("write {}: {err}", path.display())))
}

/// JSON when it parses, raw trimmed text otherwise, `null` when nothing was written.
fn read_result(path: &Path) -> Value {
    let Ok(raw) = fs::read_to_string(path) else {
        return Value::Null;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
