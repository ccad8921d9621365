//! Plan scheduler.
//!
//! Validates the plan, then walks each scope (the top level, or one loop
//! iteration) as a frontier: every pending step whose dependencies have settled
//! is dispatched to a scoped worker thread, at most `max_workers` at a time.
//! Workers report over a channel; this thread is the only writer of the
//! variable store, except that a running Loop publishes its own progress under
//! `result.<loop>.iterations`.
//!
//! Settlement rules:
//! - a Decision prunes the steps of its unselected branch (both branches when the
//!   Decision itself was skipped after failing);
//! - a pending step whose dependencies were all pruned is pruned too;
//! - a failed step that the recovery policy skipped counts as settled;
//! - an aborted step stops dispatch; in-flight siblings still finish.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::graph::ExecutionGraph;
use crate::core::invariants::validate_plan;
use crate::core::recovery::{
    AttemptRecord, FailureContext, RecoveryAction, RecoveryDecision, RecoveryPolicy, fingerprint,
};
use crate::core::resolve::{resolve_json, resolve_string, resolve_template, type_name};
use crate::core::types::{ExecutionResult, PlanResult};
use crate::core::variables::VariableStore;
use crate::error::StepError;
use crate::executors::{ExecContext, HandlerTable, StepAttempt, StepFailure, StepOutput};
use crate::io::config::EngineConfig;
use crate::io::oplog::{Journal, OperationLog, TransactionStatus};
use crate::plan::{LoopParams, LoopSource, PlanStep, StepAction, TaskPlan};

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Simulate mutating steps; no transaction is opened.
    pub dry_run: bool,
    /// Append to this open transaction instead of opening a new one.
    pub transaction_id: Option<String>,
    /// Directory for relative paths and processes; the current directory when absent.
    pub workdir: Option<PathBuf>,
}

pub struct Scheduler<'e> {
    config: &'e EngineConfig,
    handlers: &'e HandlerTable,
    policy: &'e RecoveryPolicy,
    log: Option<&'e OperationLog>,
}

/// Read-only state shared by every worker of one execution.
struct Run<'r> {
    plan: &'r TaskPlan,
    graph: &'r ExecutionGraph,
    workdir: &'r Path,
    dry_run: bool,
    journal: Option<Journal<'r>>,
}

#[derive(Debug, Default)]
struct Report {
    executed: Vec<String>,
    skipped: Vec<String>,
    step_results: BTreeMap<String, ExecutionResult>,
    /// `(step id, error)` of the step that aborted this scope.
    failure: Option<(String, String)>,
    /// Fingerprints of failures the policy skipped; scored once the plan ends.
    skip_fingerprints: Vec<String>,
}

impl Report {
    /// Merge a nested scope's report. Its failure is not inherited; the enclosing
    /// Loop step reports it.
    fn absorb(&mut self, other: Report) {
        self.executed.extend(other.executed);
        self.skipped.extend(other.skipped);
        self.step_results.extend(other.step_results);
        self.skip_fingerprints.extend(other.skip_fingerprints);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Settled,
    Pruned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Succeeded,
    Skipped,
    Failed,
}

/// Final outcome of one step, after recovery.
#[derive(Debug)]
struct StepRun {
    result: ExecutionResult,
    fields: Map<String, Value>,
    branch: Option<bool>,
    disposition: Disposition,
    fingerprint: Option<String>,
    /// Body executions of a Loop step.
    nested: Report,
}

impl StepRun {
    fn finish(
        output: StepOutput,
        disposition: Disposition,
        attempts: u32,
        started: Instant,
        nested: Report,
    ) -> Self {
        let mut result = output.result;
        result.success = disposition == Disposition::Succeeded;
        result.attempts = attempts;
        result.duration_ms = elapsed_ms(started);
        Self {
            result,
            fields: output.fields,
            branch: output.branch.filter(|_| disposition == Disposition::Succeeded),
            disposition,
            fingerprint: None,
            nested,
        }
    }

    fn crashed(message: String) -> Self {
        let output = StepOutput {
            result: ExecutionResult {
                error: Some(message),
                ..ExecutionResult::default()
            },
            ..StepOutput::default()
        };
        Self::finish(output, Disposition::Failed, 1, Instant::now(), Report::default())
    }
}

impl<'e> Scheduler<'e> {
    pub fn new(
        config: &'e EngineConfig,
        handlers: &'e HandlerTable,
        policy: &'e RecoveryPolicy,
        log: Option<&'e OperationLog>,
    ) -> Self {
        Self {
            config,
            handlers,
            policy,
            log,
        }
    }

    /// Execute `plan` with `initial` variables layered over the plan's own.
    ///
    /// Plan rejection (cycle, unknown dependency, invalid step) is returned as an
    /// error wrapping [`crate::error::PlanError`] before any step runs. Step
    /// failures never escape: they end up in the returned [`PlanResult`].
    #[instrument(skip_all, fields(plan_id = %plan.id, dry_run = options.dry_run))]
    pub fn execute(
        &self,
        plan: &TaskPlan,
        initial: Map<String, Value>,
        options: &ExecuteOptions,
    ) -> Result<PlanResult> {
        let started = Instant::now();
        let graph = validate_plan(plan)?;
        let workdir = std::path::absolute(options.workdir.as_deref().unwrap_or(Path::new(".")))
            .context("resolve working directory")?;
        let transaction_id = self.open_transaction(plan, options)?;

        let mut vars = plan.variables.clone();
        vars.extend(initial);
        let store = VariableStore::new(vars);
        let run = Run {
            plan,
            graph: &graph,
            workdir: &workdir,
            dry_run: options.dry_run,
            journal: self
                .log
                .zip(transaction_id.as_deref())
                .map(|(log, id)| Journal::new(log, id)),
        };
        info!(steps = plan.steps.len(), transaction_id = ?transaction_id, "executing plan");

        let mut report = Report::default();
        self.run_scope(&run, None, &store, "", &mut report);

        let success = report.failure.is_none();
        for fingerprint in &report.skip_fingerprints {
            self.policy.record(fingerprint, RecoveryAction::Skip, success);
        }
        if success
            && let Some(log) = self.log
            && let Some(id) = transaction_id.as_deref()
        {
            log.set_status(id, TransactionStatus::Committed)?;
        }
        let (failed_step, error) = report.failure.unzip();
        if let Some(step) = &failed_step {
            warn!(step_id = %step, "plan failed");
        } else {
            info!(executed = report.executed.len(), "plan succeeded");
        }

        Ok(PlanResult {
            plan_id: plan.id.clone(),
            success,
            executed: report.executed,
            skipped: report.skipped,
            step_results: report.step_results,
            variables: store.snapshot(),
            failed_step,
            error,
            transaction_id,
            dry_run: options.dry_run,
            duration_ms: elapsed_ms(started),
        })
    }

    fn open_transaction(&self, plan: &TaskPlan, options: &ExecuteOptions) -> Result<Option<String>> {
        if options.dry_run {
            if options.transaction_id.is_some() {
                warn!("dry run ignores the requested transaction");
            }
            return Ok(None);
        }
        let Some(log) = self.log else {
            if let Some(id) = &options.transaction_id {
                bail!("cannot append to transaction {id} without an operation log");
            }
            return Ok(None);
        };
        let tx = match &options.transaction_id {
            Some(id) => log.resume(id)?,
            None => log.begin(&plan.id)?,
        };
        Ok(Some(tx.id))
    }

    /// Run every step of `scope` against `store`. Result keys get `suffix`
    /// (`[i]` per enclosing loop iteration). Returns false when a step aborted.
    fn run_scope(
        &self,
        run: &Run<'_>,
        scope: Option<&str>,
        store: &VariableStore,
        suffix: &str,
        report: &mut Report,
    ) -> bool {
        let steps = run.graph.scope_steps(scope);
        let mut state: BTreeMap<&str, NodeState> =
            steps.iter().map(|id| (*id, NodeState::Pending)).collect();
        let mut aborted = false;
        let (tx, rx) = mpsc::channel::<(&str, StepRun)>();

        thread::scope(|s| {
            let mut in_flight = 0usize;
            loop {
                prune_dead(run.graph, &steps, &mut state, report);
                if !aborted {
                    for &id in &steps {
                        if in_flight >= self.config.max_workers {
                            break;
                        }
                        if state.get(id) != Some(&NodeState::Pending)
                            || !is_ready(run.graph, id, &state)
                        {
                            continue;
                        }
                        state.insert(id, NodeState::Running);
                        in_flight += 1;
                        debug!(step_id = id, suffix, "dispatching step");
                        let tx = tx.clone();
                        s.spawn(move || {
                            let outcome =
                                catch_unwind(AssertUnwindSafe(|| self.run_node(run, id, store, suffix)))
                                    .unwrap_or_else(|_| {
                                        StepRun::crashed(format!("step '{id}' panicked"))
                                    });
                            // The receiver outlives every worker of this scope.
                            let _ = tx.send((id, outcome));
                        });
                    }
                }
                if in_flight == 0 {
                    break;
                }
                let Ok((id, outcome)) = rx.recv() else {
                    break;
                };
                in_flight -= 1;
                if !self.settle(run, id, outcome, store, suffix, &mut state, report) {
                    aborted = true;
                }
            }
        });
        !aborted
    }

    /// Publish one finished step. Returns false when it aborted the scope.
    #[allow(clippy::too_many_arguments)]
    fn settle<'s>(
        &self,
        run: &Run<'_>,
        id: &'s str,
        outcome: StepRun,
        store: &VariableStore,
        suffix: &str,
        state: &mut BTreeMap<&'s str, NodeState>,
        report: &mut Report,
    ) -> bool {
        state.insert(id, NodeState::Settled);
        let StepRun {
            result,
            fields,
            branch,
            disposition,
            fingerprint,
            nested,
        } = outcome;
        report.absorb(nested);
        store.record_step(id, result.meta(), fields);
        let error = result.error.clone();
        report.step_results.insert(format!("{id}{suffix}"), result);

        match disposition {
            Disposition::Succeeded => {
                report.executed.push(id.to_string());
                if let Some(branch) = branch {
                    prune_branches(run, id, Some(branch), state, report);
                }
                true
            }
            Disposition::Skipped => {
                info!(step_id = id, "failed step skipped");
                report.skipped.push(id.to_string());
                report.skip_fingerprints.extend(fingerprint);
                prune_branches(run, id, None, state, report);
                true
            }
            Disposition::Failed => {
                // The first abort is the cause; later in-flight failures only add results.
                if report.failure.is_none() {
                    report.failure = Some((id.to_string(), error.unwrap_or_default()));
                }
                false
            }
        }
    }

    fn run_node(&self, run: &Run<'_>, id: &str, store: &VariableStore, suffix: &str) -> StepRun {
        let Some(step) = run.plan.step(id) else {
            return StepRun::crashed(format!("step '{id}' is not part of the plan"));
        };
        let timeout = Duration::from_secs(
            step.timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
        );
        match &step.action {
            StepAction::Loop(params) => self.run_loop(run, step, params, store, suffix),
            action => self.with_recovery(step, |_| {
                let ctx = ExecContext {
                    step,
                    store,
                    workdir: run.workdir,
                    timeout,
                    dry_run: run.dry_run,
                    journal: run.journal,
                };
                self.handlers.dispatch(action, &ctx)
            }),
        }
    }

    /// Run attempts until one succeeds or the policy skips or aborts.
    fn with_recovery(
        &self,
        step: &PlanStep,
        mut attempt: impl FnMut(&mut Report) -> StepAttempt,
    ) -> StepRun {
        let started = Instant::now();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut retried: Option<String> = None;
        let mut retries_used = 0u32;
        loop {
            let mut nested = Report::default();
            let attempts = retries_used + 1;
            let failure = match attempt(&mut nested) {
                Ok(output) => {
                    if let Some(first) = retried.take() {
                        self.policy.record(&first, RecoveryAction::Retry, true);
                    }
                    debug!(step_id = %step.id, attempts, "step succeeded");
                    return StepRun::finish(output, Disposition::Succeeded, attempts, started, nested);
                }
                Err(failure) => failure,
            };

            let message = failure.error.to_string();
            let key = fingerprint(&message);
            warn!(step_id = %step.id, attempt = attempts, err = %message, "step attempt failed");
            history.push(AttemptRecord {
                attempt: attempts,
                message: message.clone(),
                fingerprint: key.clone(),
            });
            let decision = self.policy.decide(&FailureContext {
                step,
                error: &failure.error,
                retries_used,
                history: &history,
            });
            if let RecoveryDecision::Retry { delay } = decision {
                debug!(step_id = %step.id, delay_ms = delay.as_millis() as u64, "retrying step");
                retried.get_or_insert(key);
                retries_used += 1;
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                continue;
            }

            if let Some(first) = retried.take() {
                self.policy.record(&first, RecoveryAction::Retry, false);
            }
            let disposition = match decision {
                RecoveryDecision::Skip => Disposition::Skipped,
                _ => Disposition::Failed,
            };
            let StepFailure { partial, .. } = failure;
            let mut output = partial.unwrap_or_default();
            output.result.error = Some(message);
            let mut outcome = StepRun::finish(output, disposition, attempts, started, nested);
            if disposition == Disposition::Skipped {
                outcome.fingerprint = Some(key);
            }
            return outcome;
        }
    }

    /// Iterate the loop body over the resolved items.
    ///
    /// Iterations run one at a time, or in waves of `max_workers` when
    /// `parallel` is set. After each wave the summaries so far are merged into
    /// `result.<loop>.iterations` of the enclosing store, so a later iteration
    /// sees every earlier wave. Iterations of the same wave do not see each other.
    #[instrument(skip_all, fields(step_id = %step.id, parallel = params.parallel))]
    fn run_loop(
        &self,
        run: &Run<'_>,
        step: &PlanStep,
        params: &LoopParams,
        store: &VariableStore,
        suffix: &str,
    ) -> StepRun {
        self.with_recovery(step, |nested| {
            let items = self.loop_items(run, params, store)?;
            let total = items.len();
            info!(total, "starting loop");
            let loop_scope = LoopScope {
                run,
                step,
                params,
                store,
                suffix,
                total,
            };

            let mut iterations: Vec<Value> = Vec::with_capacity(total);
            store.record_field(&step.id, "iterations", Value::Array(Vec::new()));
            let width = if params.parallel {
                self.config.max_workers.max(1)
            } else {
                1
            };
            for (wave, chunk) in items.chunks(width).enumerate() {
                let first = wave * width;
                let outcomes: Vec<Iteration> = if chunk.len() == 1 {
                    vec![self.iteration(&loop_scope, first, &chunk[0])]
                } else {
                    thread::scope(|s| {
                        let handles: Vec<_> = chunk
                            .iter()
                            .enumerate()
                            .map(|(offset, item)| {
                                let loop_scope = &loop_scope;
                                s.spawn(move || self.iteration(loop_scope, first + offset, item))
                            })
                            .collect();
                        handles
                            .into_iter()
                            .enumerate()
                            .map(|(offset, handle)| {
                                handle
                                    .join()
                                    .unwrap_or_else(|_| Iteration::panicked(first + offset))
                            })
                            .collect()
                    })
                };

                let mut failed: Option<(usize, Option<(String, String)>)> = None;
                for (offset, outcome) in outcomes.into_iter().enumerate() {
                    let Iteration {
                        mut report,
                        summary,
                        ok,
                    } = outcome;
                    if !ok && failed.is_none() {
                        failed = Some((first + offset, report.failure.take()));
                    }
                    nested.absorb(report);
                    iterations.push(summary);
                }
                store.record_field(&step.id, "iterations", Value::Array(iterations.clone()));
                if let Some((index, cause)) = failed {
                    let message = match cause {
                        Some((body, err)) => {
                            format!("loop iteration {index} failed at step '{body}': {err}")
                        }
                        None => format!("loop iteration {index} failed"),
                    };
                    let partial = StepOutput::default()
                        .field("count", total)
                        .field("iterations", iterations);
                    return Err(StepFailure::with_output(StepError::permanent(message), partial));
                }
            }

            let mut out = StepOutput::success()
                .field("count", total)
                .field("items", items)
                .field("iterations", iterations);
            out.result.value = Some(json!(total));
            Ok(out)
        })
    }

    /// One pass over the loop body in a child store.
    fn iteration(&self, scope: &LoopScope<'_, '_>, index: usize, item: &Value) -> Iteration {
        let mut extra = Map::new();
        extra.insert("loop_item".to_string(), item.clone());
        extra.insert("loop_index".to_string(), json!(index));
        extra.insert("loop_first".to_string(), json!(index == 0));
        extra.insert("loop_last".to_string(), json!(index + 1 == scope.total));
        let child = scope.store.child(extra);
        let suffix = format!("{}[{index}]", scope.suffix);

        let mut report = Report::default();
        let ok = self.run_scope(scope.run, Some(&scope.step.id), &child, &suffix, &mut report);
        let summary: Map<String, Value> = scope
            .params
            .body
            .iter()
            .filter_map(|body| child.step_result(body).map(|result| (body.clone(), result)))
            .collect();
        debug!(step_id = %scope.step.id, index, ok, "loop iteration finished");
        Iteration {
            report,
            summary: Value::Object(summary),
            ok,
        }
    }

    fn loop_items(
        &self,
        run: &Run<'_>,
        params: &LoopParams,
        store: &VariableStore,
    ) -> Result<Vec<Value>, StepError> {
        let limit = self.config.max_loop_iterations;
        let items = match &params.items {
            LoopSource::List(items) => items
                .iter()
                .map(|item| resolve_json(item, store))
                .collect::<Result<Vec<_>, _>>()?,
            LoopSource::Range { start, end, step } => range_items(*start, *end, *step, limit)?,
            LoopSource::Glob(pattern) => glob_items(&resolve_string(pattern, store)?, run.workdir)?,
            LoopSource::Variable(template) => match resolve_template(template, store)? {
                Value::Array(items) => items,
                Value::Object(map) => map
                    .into_iter()
                    .map(|(key, value)| json!({"key": key, "value": value}))
                    .collect(),
                other => {
                    return Err(StepError::permanent(format!(
                        "loop source resolved to {}, expected a list or object",
                        type_name(&other)
                    )));
                }
            },
        };
        if items.len() > limit {
            return Err(StepError::permanent(format!(
                "loop resolves to {} items; the limit is {limit}",
                items.len()
            )));
        }
        Ok(items)
    }
}

struct LoopScope<'a, 'r> {
    run: &'a Run<'r>,
    step: &'a PlanStep,
    params: &'a LoopParams,
    store: &'a VariableStore,
    suffix: &'a str,
    total: usize,
}

struct Iteration {
    report: Report,
    summary: Value,
    ok: bool,
}

impl Iteration {
    fn panicked(index: usize) -> Self {
        Self {
            report: Report {
                failure: Some((format!("iteration {index}"), "worker panicked".to_string())),
                ..Report::default()
            },
            summary: Value::Null,
            ok: false,
        }
    }
}

fn is_ready(graph: &ExecutionGraph, id: &str, state: &BTreeMap<&str, NodeState>) -> bool {
    graph.dependencies(id).all(|dep| {
        matches!(
            state.get(dep),
            Some(NodeState::Settled | NodeState::Pruned) | None
        )
    })
}

/// Prune pending steps whose dependencies were all pruned, to a fixpoint.
fn prune_dead<'s>(
    graph: &ExecutionGraph,
    steps: &[&'s str],
    state: &mut BTreeMap<&'s str, NodeState>,
    report: &mut Report,
) {
    loop {
        let dead: Vec<&'s str> = steps
            .iter()
            .copied()
            .filter(|id| {
                let mut deps = graph.dependencies(id).peekable();
                state.get(id) == Some(&NodeState::Pending)
                    && deps.peek().is_some()
                    && deps.all(|dep| state.get(dep) == Some(&NodeState::Pruned))
            })
            .collect();
        if dead.is_empty() {
            return;
        }
        for id in dead {
            debug!(step_id = id, "pruned: no live dependency");
            state.insert(id, NodeState::Pruned);
            report.skipped.push(id.to_string());
        }
    }
}

/// Prune the branch a Decision did not select; both when `selected` is `None`.
fn prune_branches(
    run: &Run<'_>,
    decision: &str,
    selected: Option<bool>,
    state: &mut BTreeMap<&str, NodeState>,
    report: &mut Report,
) {
    let Some(StepAction::Decision(params)) = run.plan.step(decision).map(|step| &step.action) else {
        return;
    };
    let losing: Vec<&String> = match selected {
        Some(true) => params.if_false.iter().collect(),
        Some(false) => params.if_true.iter().collect(),
        None => params.if_true.iter().chain(&params.if_false).collect(),
    };
    for id in losing {
        if let Some(current) = state.get_mut(id.as_str())
            && *current == NodeState::Pending
        {
            *current = NodeState::Pruned;
            debug!(step_id = %id, decision, "pruned: branch not selected");
            report.skipped.push(id.clone());
        }
    }
}

fn range_items(start: i64, end: i64, step: i64, limit: usize) -> Result<Vec<Value>, StepError> {
    if step == 0 {
        return Err(StepError::InvalidParams("range step must not be 0".to_string()));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        if out.len() == limit {
            return Err(StepError::permanent(format!(
                "loop range exceeds the limit of {limit} items"
            )));
        }
        out.push(json!(current));
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(out)
}

/// Matching paths in glob order, relative to `workdir` when under it.
fn glob_items(pattern: &str, workdir: &Path) -> Result<Vec<Value>, StepError> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        workdir.join(pattern).to_string_lossy().into_owned()
    };
    let paths = glob::glob(&full)
        .map_err(|err| StepError::InvalidParams(format!("glob '{pattern}': {err}")))?;
    let mut out = Vec::new();
    for entry in paths {
        let path = entry.map_err(|err| StepError::execution(format!("glob '{pattern}': {err}")))?;
        let shown = path.strip_prefix(workdir).unwrap_or(&path);
        out.push(Value::String(shown.display().to_string()));
    }
    Ok(out)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedHandler, command, decision, literal, loop_over, parallel, plan, scripted_table,
        succeeded, with_deps,
    };

    fn execute(plan: &TaskPlan, handlers: &HandlerTable) -> PlanResult {
        execute_with(&EngineConfig::default(), plan, handlers)
    }

    fn execute_with(config: &EngineConfig, plan: &TaskPlan, handlers: &HandlerTable) -> PlanResult {
        let policy = RecoveryPolicy::default();
        Scheduler::new(config, handlers, &policy, None)
            .execute(plan, Map::new(), &ExecuteOptions::default())
            .expect("execute")
    }

    #[test]
    fn realized_order_is_topological() {
        let plan = plan(
            "p",
            vec![
                with_deps(command("c", "c"), &["a", "b"]),
                with_deps(command("b", "b"), &["a"]),
                command("a", "a"),
                with_deps(command("d", "d"), &["a"]),
            ],
        );
        let result = execute(&plan, &scripted_table(ScriptedHandler::succeeding()));
        assert!(result.success);
        assert_eq!(result.executed.len(), 4);
        assert!(result.position("a") < result.position("b"));
        assert!(result.position("b") < result.position("c"));
        assert!(result.position("a") < result.position("d"));
    }

    #[test]
    fn decision_prunes_unselected_branch_and_its_dependents() {
        let plan = plan(
            "p",
            vec![
                decision("check", literal(false), &["yes"], &["no"]),
                command("yes", "yes"),
                command("no", "no"),
                with_deps(command("after-yes", "x"), &["yes"]),
                with_deps(command("join", "j"), &["yes", "no"]),
            ],
        );
        let handlers = scripted_table(ScriptedHandler::succeeding());
        let result = execute(&plan, &handlers);

        assert!(result.success);
        assert!(result.position("no").is_some());
        assert!(result.position("yes").is_none());
        assert!(result.position("after-yes").is_none());
        assert!(result.position("join").is_some());
        assert!(result.skipped.contains(&"yes".to_string()));
        assert!(result.skipped.contains(&"after-yes".to_string()));
    }

    #[test]
    fn decision_waits_for_the_step_its_condition_inspects() {
        let plan = plan(
            "p",
            vec![
                command("build", "build"),
                decision("check", succeeded("build"), &["yes"], &["no"]),
                command("yes", "yes"),
                command("no", "no"),
            ],
        );
        let handler = ScriptedHandler::succeeding().delayed("build", Duration::from_millis(200));
        let result = execute(&plan, &scripted_table(handler));

        assert!(result.success);
        assert!(result.position("build") < result.position("check"));
        assert!(result.position("yes").is_some());
        assert!(result.position("no").is_none());
        assert_eq!(result.skipped, vec!["no".to_string()]);
    }

    #[test]
    fn first_abort_is_reported_when_a_sibling_fails_later() {
        let plan = plan("p", vec![command("fast", "fast"), command("slow", "slow")]);
        let handler = ScriptedHandler::failing_on(&["fast", "slow"])
            .delayed("slow", Duration::from_millis(200));
        let result = execute(&plan, &scripted_table(handler.clone()));

        assert!(!result.success);
        assert_eq!(handler.calls("slow"), 1);
        assert_eq!(result.failed_step.as_deref(), Some("fast"));
        assert!(
            result
                .error
                .as_deref()
                .is_some_and(|err| err.contains("scripted failure: fast")),
            "{:?}",
            result.error
        );
        assert!(result.step_results.contains_key("slow"));
    }

    #[test]
    fn independent_steps_run_concurrently_up_to_max_workers() {
        let delay = Duration::from_millis(150);
        let plan = plan(
            "p",
            vec![command("a", "a"), command("b", "b"), command("c", "c")],
        );
        let handler = ScriptedHandler::succeeding()
            .delayed("a", delay)
            .delayed("b", delay)
            .delayed("c", delay);
        let config = EngineConfig {
            max_workers: 2,
            ..EngineConfig::default()
        };
        let result = execute_with(&config, &plan, &scripted_table(handler.clone()));

        assert!(result.success);
        assert_eq!(result.executed.len(), 3);
        assert_eq!(handler.peak_concurrency(), 2);
    }

    #[test]
    fn single_worker_runs_steps_one_at_a_time() {
        let plan = plan("p", vec![command("a", "a"), command("b", "b")]);
        let handler = ScriptedHandler::succeeding().delayed("a", Duration::from_millis(50));
        let config = EngineConfig {
            max_workers: 1,
            ..EngineConfig::default()
        };
        let result = execute_with(&config, &plan, &scripted_table(handler.clone()));

        assert!(result.success);
        assert_eq!(handler.peak_concurrency(), 1);
    }

    #[test]
    fn abort_stops_dispatch() {
        let plan = plan(
            "p",
            vec![command("a", "fail"), with_deps(command("b", "b"), &["a"])],
        );
        let handlers = scripted_table(ScriptedHandler::failing_on(&["fail"]));
        let result = execute(&plan, &handlers);

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("a"));
        assert!(result.position("b").is_none());
        assert_eq!(result.step_results["a"].attempts, 1);
    }

    #[test]
    fn skipped_optional_step_keeps_dependents_live() {
        let mut flaky = command("a", "fail");
        flaky.optional = true;
        let plan = plan("p", vec![flaky, with_deps(command("b", "b"), &["a"])]);
        let handlers = scripted_table(ScriptedHandler::failing_on(&["fail"]));
        let result = execute(&plan, &handlers);

        assert!(result.success);
        assert_eq!(result.skipped, vec!["a".to_string()]);
        assert!(result.position("b").is_some());
        assert_eq!(
            result.variables["result"]["a"]["success"],
            Value::Bool(false)
        );
    }

    #[test]
    fn retries_are_bounded_by_policy() {
        let mut flaky = command("a", "fail");
        flaky.retry.max_retries = 2;
        let plan = plan("p", vec![flaky]);
        let handler = ScriptedHandler::failing_on(&["fail"]);
        let handlers = scripted_table(handler.clone());
        let result = execute(&plan, &handlers);

        assert!(!result.success);
        assert_eq!(handler.calls("fail"), 3);
        assert_eq!(result.step_results["a"].attempts, 3);
    }

    #[test]
    fn loop_runs_body_per_item_with_indexed_results() {
        let plan = plan(
            "p",
            vec![
                loop_over("each", json!(["x", "y"]), &["body"]),
                command("body", "item ${loop_item}"),
                with_deps(command("after", "done"), &["body"]),
            ],
        );
        let handler = ScriptedHandler::succeeding();
        let result = execute(&plan, &scripted_table(handler.clone()));

        assert!(result.success);
        assert_eq!(handler.calls("item x"), 1);
        assert_eq!(handler.calls("item y"), 1);
        assert!(result.step_results.contains_key("body[0]"));
        assert!(result.step_results.contains_key("body[1]"));
        assert_eq!(result.variables["result"]["each"]["count"], json!(2));
        assert!(result.position("each") < result.position("after"));
    }

    #[test]
    fn parallel_loop_merges_results_in_index_order() {
        let plan = plan(
            "p",
            vec![
                parallel(loop_over("each", json!(["x", "y", "z"]), &["work"])),
                command("work", "work ${loop_item} ${loop_index} ${loop_last}"),
            ],
        );
        // Earlier items finish last.
        let handler = ScriptedHandler::succeeding()
            .delayed("work x 0 false", Duration::from_millis(300))
            .delayed("work y 1 false", Duration::from_millis(150));
        let result = execute(&plan, &scripted_table(handler.clone()));

        assert!(result.success, "{:?}", result.error);
        assert_eq!(handler.peak_concurrency(), 3);
        assert_eq!(handler.calls("work z 2 true"), 1);
        let iterations = &result.variables["result"]["each"]["iterations"];
        assert_eq!(iterations[0]["work"]["stdout"], json!("work x 0 false"));
        assert_eq!(iterations[1]["work"]["stdout"], json!("work y 1 false"));
        assert_eq!(iterations[2]["work"]["stdout"], json!("work z 2 true"));
        for key in ["work[0]", "work[1]", "work[2]"] {
            assert!(result.step_results.contains_key(key), "{key}");
        }
    }

    #[test]
    fn parallel_loop_runs_in_waves_of_max_workers() {
        let plan = plan(
            "p",
            vec![
                parallel(loop_over("each", json!([0, 1, 2]), &["work"])),
                command("work", "work ${loop_item}"),
            ],
        );
        let delay = Duration::from_millis(100);
        let handler = ScriptedHandler::succeeding()
            .delayed("work 0", delay)
            .delayed("work 1", delay)
            .delayed("work 2", delay);
        let config = EngineConfig {
            max_workers: 2,
            ..EngineConfig::default()
        };
        let result = execute_with(&config, &plan, &scripted_table(handler.clone()));

        assert!(result.success);
        assert_eq!(handler.peak_concurrency(), 2);
        assert_eq!(handler.started().last().map(String::as_str), Some("work 2"));
    }

    #[test]
    fn sequential_iteration_sees_earlier_iterations() {
        let plan = plan(
            "p",
            vec![
                loop_over("each", json!(["x", "y"]), &["body"]),
                command("body", "item ${loop_item} after ${result.each.iterations}"),
            ],
        );
        let handler = ScriptedHandler::succeeding();
        let result = execute(&plan, &scripted_table(handler.clone()));

        assert!(result.success, "{:?}", result.error);
        let started = handler.started();
        assert_eq!(started[0], "item x after []");
        assert!(started[1].starts_with("item y after [{\"body\":"), "{}", started[1]);
        assert!(started[1].contains("item x after []"), "{}", started[1]);
    }

    #[test]
    fn range_and_limits() {
        assert_eq!(
            range_items(0, 6, 2, 10).expect("range"),
            vec![json!(0), json!(2), json!(4)]
        );
        assert_eq!(range_items(3, 0, -1, 10).expect("range").len(), 3);
        assert!(range_items(0, 100, 1, 10).is_err());
        assert!(range_items(0, 1, 0, 10).is_err());
    }

    #[test]
    fn glob_lists_matches_relative_to_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("b.txt"), "").expect("seed");
        std::fs::write(temp.path().join("a.txt"), "").expect("seed");
        std::fs::write(temp.path().join("c.md"), "").expect("seed");
        let items = glob_items("*.txt", temp.path()).expect("glob");
        assert_eq!(items, vec![json!("a.txt"), json!("b.txt")]);
    }
}
