//! Test-only helpers for building plans, handler fixtures and fake transports.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::core::condition::Condition;
use crate::core::resolve::resolve_string;
use crate::core::variables::VariableStore;
use crate::engine::Engine;
use crate::error::StepError;
use crate::executors::{ExecContext, Handler, HandlerTable, StepAttempt, StepOutput};
use crate::io::config::EngineConfig;
use crate::io::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::io::oplog::{Journal, OperationLog};
use crate::io::paths::StatePaths;
use crate::plan::{
    CommandParams, DecisionParams, LoopParams, LoopSource, PlanStep, StepAction, TaskPlan,
};

/// Command step with default settings.
pub fn command(id: &str, cmd: &str) -> PlanStep {
    PlanStep::new(
        id,
        StepAction::Command(CommandParams {
            command: cmd.to_string(),
            workdir: None,
            env: BTreeMap::new(),
            stdin: None,
            accept_codes: vec![0],
            undo: None,
        }),
    )
}

pub fn with_deps(mut step: PlanStep, deps: &[&str]) -> PlanStep {
    step.depends_on
        .extend(deps.iter().map(|dep| dep.to_string()));
    step
}

pub fn decision(id: &str, condition: Condition, if_true: &[&str], if_false: &[&str]) -> PlanStep {
    PlanStep::new(
        id,
        StepAction::Decision(DecisionParams {
            condition,
            if_true: if_true.iter().map(|s| s.to_string()).collect(),
            if_false: if_false.iter().map(|s| s.to_string()).collect(),
        }),
    )
}

pub fn literal(value: bool) -> Condition {
    Condition::Literal { value }
}

/// Loop over `items`: an array is a literal list, a string a variable template.
pub fn loop_over(id: &str, items: Value, body: &[&str]) -> PlanStep {
    let items = match items {
        Value::Array(list) => LoopSource::List(list),
        Value::String(template) => LoopSource::Variable(template),
        other => LoopSource::List(vec![other]),
    };
    PlanStep::new(
        id,
        StepAction::Loop(LoopParams {
            items,
            body: body.iter().map(|s| s.to_string()).collect(),
            parallel: false,
        }),
    )
}

pub fn parallel(mut step: PlanStep) -> PlanStep {
    if let StepAction::Loop(params) = &mut step.action {
        params.parallel = true;
    }
    step
}

pub fn succeeded(step: &str) -> Condition {
    Condition::Succeeded {
        step: step.to_string(),
    }
}

pub fn plan(id: &str, steps: Vec<PlanStep>) -> TaskPlan {
    TaskPlan::new(id, steps)
}

/// Scratch directory, a variable store and an optional open transaction for
/// driving one handler directly.
pub struct ExecFixture {
    temp: TempDir,
    workdir: PathBuf,
    pub store: VariableStore,
    pub dry_run: bool,
    log: Option<OperationLog>,
    transaction_id: Option<String>,
}

impl ExecFixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path().join("work");
        std::fs::create_dir_all(&workdir).expect("create workdir");
        Self {
            temp,
            workdir,
            store: VariableStore::new(Map::new()),
            dry_run: false,
            log: None,
            transaction_id: None,
        }
    }

    /// Fixture whose contexts journal into a fresh open transaction.
    pub fn with_transaction() -> Self {
        let mut fixture = Self::new();
        let paths = StatePaths::new(fixture.temp.path().join("state"));
        let log = OperationLog::open(&paths).expect("open log");
        let tx = log.begin("fixture").expect("begin");
        fixture.transaction_id = Some(tx.id);
        fixture.log = Some(log);
        fixture
    }

    /// Handler context for `step`: 10 s timeout, journal when a transaction is open.
    pub fn context<'a>(&'a self, step: &'a PlanStep) -> ExecContext<'a> {
        ExecContext {
            step,
            store: &self.store,
            workdir: &self.workdir,
            timeout: Duration::from_secs(10),
            dry_run: self.dry_run,
            journal: self
                .log
                .as_ref()
                .zip(self.transaction_id.as_deref())
                .map(|(log, id)| Journal::new(log, id)),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn log(&self) -> &OperationLog {
        self.log.as_ref().expect("fixture has no transaction")
    }
}

impl Default for ExecFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport that replays scripted responses and records every request.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn json(status: u16, body: Value) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            content_type: Some("application/json".to_string()),
            body: body.to_string(),
        })
    }

    pub fn text(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.to_string(),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HttpTransport for FakeTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted response".to_string())))
    }
}

#[derive(Default)]
struct Script {
    /// Remaining failures per resolved command; `usize::MAX` fails forever.
    failures: BTreeMap<String, usize>,
    delays: BTreeMap<String, Duration>,
    calls: BTreeMap<String, usize>,
    /// Resolved commands in call order.
    started: Vec<String>,
    in_flight: usize,
    peak: usize,
}

/// Command handler that never spawns: it resolves the command text, counts the
/// call, sleeps when the script says so and then fails or succeeds. Clones
/// share their script.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    script: Arc<Mutex<Script>>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Every call of these commands fails with a retryable error.
    pub fn failing_on(commands: &[&str]) -> Self {
        let handler = Self::default();
        for cmd in commands {
            handler.fail_times(cmd, usize::MAX);
        }
        handler
    }

    /// The first `times` calls of `cmd` fail, later ones succeed.
    pub fn flaky(cmd: &str, times: usize) -> Self {
        let handler = Self::default();
        handler.fail_times(cmd, times);
        handler
    }

    fn fail_times(&self, cmd: &str, times: usize) {
        self.lock().failures.insert(cmd.to_string(), times);
    }

    /// Calls of `cmd` sleep for `delay` before answering.
    pub fn delayed(self, cmd: &str, delay: Duration) -> Self {
        self.lock().delays.insert(cmd.to_string(), delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self, cmd: &str) -> usize {
        self.lock().calls.get(cmd).copied().unwrap_or(0)
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Most calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak
    }
}

impl Handler<CommandParams> for ScriptedHandler {
    fn run(&self, params: &CommandParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let cmd = resolve_string(&params.command, ctx.store)?;
        let delay = {
            let mut script = self.lock();
            *script.calls.entry(cmd.clone()).or_default() += 1;
            script.started.push(cmd.clone());
            script.in_flight += 1;
            script.peak = script.peak.max(script.in_flight);
            script.delays.get(&cmd).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut script = self.lock();
        script.in_flight -= 1;
        if let Some(remaining) = script.failures.get_mut(&cmd)
            && *remaining > 0
        {
            if *remaining != usize::MAX {
                *remaining -= 1;
            }
            return Err(StepError::execution(format!("scripted failure: {cmd}")).into());
        }
        Ok(StepOutput::success().field("stdout", cmd))
    }
}

/// Standard handlers with `command` replaced and no network access.
pub fn scripted_table(command: ScriptedHandler) -> HandlerTable {
    let mut table = HandlerTable::with_transport(
        &EngineConfig::default(),
        Box::new(FakeTransport::default()),
    );
    table.command = Box::new(command);
    table
}

/// Engine rooted in a fresh temp directory.
pub fn temp_engine() -> (TempDir, Engine) {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = Engine::open(temp.path()).expect("open engine");
    (temp, engine)
}
