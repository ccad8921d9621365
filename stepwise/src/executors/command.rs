//! Command steps: `sh -c <command>` with captured output.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use super::{ExecContext, Handler, StepAttempt, StepFailure, StepOutput, last_line, with_streams};
use crate::core::resolve::resolve_string;
use crate::error::StepError;
use crate::io::oplog::OperationAction;
use crate::io::process::{run_command_with_timeout, shell_command};
use crate::plan::CommandParams;

#[derive(Debug, Clone)]
pub struct CommandHandler {
    output_limit_bytes: usize,
}

impl CommandHandler {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl Handler<CommandParams> for CommandHandler {
    #[instrument(skip_all, fields(step_id = %ctx.step.id))]
    fn run(&self, params: &CommandParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let command = resolve_string(&params.command, ctx.store)?;
        let workdir = match &params.workdir {
            Some(dir) => ctx.path(&resolve_string(dir, ctx.store)?),
            None => ctx.workdir.to_path_buf(),
        };
        let env = params
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), resolve_string(value, ctx.store)?)))
            .collect::<Result<BTreeMap<_, _>, StepFailure>>()?;
        let stdin = params
            .stdin
            .as_deref()
            .map(|input| resolve_string(input, ctx.store))
            .transpose()?;
        let undo = params
            .undo
            .as_deref()
            .map(|undo| resolve_string(undo, ctx.store))
            .transpose()?;

        if ctx.dry_run {
            debug!(%command, "dry run: command not started");
            return Ok(with_streams(
                StepOutput::simulated().field("command", command),
                String::new(),
                String::new(),
                Some(0),
            ));
        }
        if !workdir.is_dir() {
            return Err(StepError::permanent(format!(
                "working directory {} does not exist",
                workdir.display()
            ))
            .into());
        }

        let mut cmd = shell_command(&command);
        cmd.current_dir(&workdir).envs(&env);
        let output = run_command_with_timeout(
            cmd,
            stdin.as_deref().map(str::as_bytes),
            ctx.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| StepError::execution(format!("run '{command}': {err:#}")))?;

        // The process ran; whatever it changed is now part of the transaction.
        if let Some(journal) = ctx.journal {
            journal
                .record(
                    &ctx.step.id,
                    OperationAction::Command {
                        command: command.clone(),
                        workdir: workdir.display().to_string(),
                        compensation: undo,
                    },
                )
                .map_err(|err| StepError::permanent(format!("record operation: {err:#}")))?;
        }

        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        let code = output.status.code();
        let accepted = code.is_some_and(|code| params.accept_codes.contains(&code));
        let reason = last_line(&stderr).map(str::to_string);
        let out = with_streams(StepOutput::success(), stdout, stderr, code);

        if output.timed_out {
            return Err(StepFailure::with_output(
                StepError::Timeout { after: ctx.timeout },
                out,
            ));
        }
        if !accepted {
            let status = match code {
                Some(code) => format!("exit code {code}"),
                None => "termination by signal".to_string(),
            };
            let message = match reason {
                Some(reason) => format!("command failed with {status}: {reason}"),
                None => format!("command failed with {status}"),
            };
            return Err(StepFailure::with_output(StepError::execution(message), out));
        }
        debug!(?code, "command succeeded");
        Ok(out)
    }
}
