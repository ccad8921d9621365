//! Engine facade: state root, config, handlers, recovery policy and
//! transactions wired once and shared by every execution.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::core::recovery::{ErrorAdvisor, RecoveryPolicy};
use crate::core::types::PlanResult;
use crate::executors::HandlerTable;
use crate::io::config::{EngineConfig, load_config};
use crate::io::http::HttpTransport;
use crate::io::ids::generate_id;
use crate::io::oplog::OperationLog;
use crate::io::paths::StatePaths;
use crate::io::rollback::TransactionManager;
use crate::io::run_log::{RunMeta, RunWriteRequest, write_run};
use crate::io::stats::{load_outcomes, write_outcomes};
use crate::planner::Planner;
use crate::plan::TaskPlan;
use crate::scheduler::{ExecuteOptions, Scheduler};

pub struct Engine {
    paths: StatePaths,
    config: EngineConfig,
    handlers: HandlerTable,
    policy: RecoveryPolicy,
    transactions: TransactionManager,
}

impl Engine {
    /// Open (creating if needed) the `.stepwise/` state under `root`.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn open(root: &Path) -> Result<Self> {
        let root = std::path::absolute(root)
            .with_context(|| format!("resolve root {}", root.display()))?;
        let paths = StatePaths::new(root);
        paths.ensure()?;
        let config = load_config(&paths.config_path)?;
        let outcomes = load_outcomes(&paths.recovery_path)?;
        let policy = RecoveryPolicy::new(outcomes).learning(config.recovery.learn);
        let handlers = HandlerTable::standard(&config);
        let log = OperationLog::open(&paths)?;
        let transactions = TransactionManager::new(
            log,
            Duration::from_secs(config.default_timeout_secs),
            config.output_limit_bytes,
        );
        Ok(Self {
            paths,
            config,
            handlers,
            policy,
            transactions,
        })
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replace the HTTP transport used by Api steps.
    pub fn with_transport(mut self, transport: Box<dyn HttpTransport>) -> Self {
        self.handlers.api = HandlerTable::with_transport(&self.config, transport).api;
        self
    }

    pub fn with_advisor(mut self, advisor: Box<dyn ErrorAdvisor>) -> Self {
        self.policy = self.policy.with_advisor(advisor);
        self
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Execute `plan` and write its run log. Relative paths default to the root.
    #[instrument(skip_all, fields(plan_id = %plan.id))]
    pub fn execute(
        &self,
        plan: &TaskPlan,
        initial: Map<String, Value>,
        options: &ExecuteOptions,
    ) -> Result<PlanResult> {
        let started_at = Utc::now();
        let mut options = options.clone();
        if options.workdir.is_none() {
            options.workdir = Some(self.paths.root.clone());
        }

        let scheduler = Scheduler::new(
            &self.config,
            &self.handlers,
            &self.policy,
            Some(self.transactions.log()),
        );
        let result = scheduler.execute(plan, initial, &options)?;

        let run_id = generate_id("run");
        let meta = RunMeta {
            run_id: run_id.clone(),
            plan_id: plan.id.clone(),
            success: result.success,
            dry_run: result.dry_run,
            transaction_id: result.transaction_id.clone(),
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            duration_ms: result.duration_ms,
        };
        let run_paths = write_run(&RunWriteRequest {
            paths: &self.paths,
            meta: &meta,
            plan,
            result: &result,
        })?;
        if self.config.recovery.learn {
            write_outcomes(&self.paths.recovery_path, &self.policy.table())?;
        }
        info!(
            %run_id,
            success = result.success,
            run_dir = %run_paths.dir.display(),
            "run recorded"
        );
        Ok(result)
    }

    /// Ask `planner` for a plan, then execute it.
    pub fn execute_request(
        &self,
        planner: &dyn Planner,
        request: &str,
        initial: Map<String, Value>,
        options: &ExecuteOptions,
    ) -> Result<PlanResult> {
        let plan = planner
            .plan(request)
            .with_context(|| format!("plan request {request:?}"))?;
        self.execute(&plan, initial, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oplog::TransactionStatus;
    use crate::io::run_log::read_result;
    use crate::io::plan_store::write_plan;
    use crate::planner::FilePlanner;
    use crate::test_support::{
        ScriptedHandler, command, plan, scripted_table, temp_engine, with_deps,
    };
    use serde_json::json;

    #[test]
    fn execute_writes_run_log_and_commits() {
        let (temp, engine) = temp_engine();
        let engine = engine.with_handlers(scripted_table(ScriptedHandler::succeeding()));
        let result = engine
            .execute(&plan("demo", vec![command("a", "echo")]), Map::new(), &ExecuteOptions::default())
            .expect("execute");

        assert!(result.success);
        let tx_id = result.transaction_id.clone().expect("transaction");
        let tx = engine
            .transactions()
            .log()
            .transaction(&tx_id)
            .expect("load")
            .expect("exists");
        assert_eq!(tx.status, TransactionStatus::Committed);

        let runs: Vec<_> = std::fs::read_dir(temp.path().join(".stepwise/runs"))
            .expect("runs")
            .collect();
        assert_eq!(runs.len(), 1);
        let run_dir = runs[0].as_ref().expect("entry").path();
        let logged = read_result(&run_dir.join("result.json")).expect("result");
        assert_eq!(logged, result);
    }

    #[test]
    fn failed_run_leaves_transaction_open() {
        let (_temp, engine) = temp_engine();
        let engine = engine.with_handlers(scripted_table(ScriptedHandler::failing_on(&["boom"])));
        let result = engine
            .execute(&plan("demo", vec![command("a", "boom")]), Map::new(), &ExecuteOptions::default())
            .expect("execute");

        assert!(!result.success);
        let tx_id = result.transaction_id.expect("transaction");
        let tx = engine.transactions().log().transaction(&tx_id).expect("load").expect("exists");
        assert_eq!(tx.status, TransactionStatus::Open);
    }

    #[test]
    fn dry_run_opens_no_transaction() {
        let (_temp, engine) = temp_engine();
        let options = ExecuteOptions {
            dry_run: true,
            ..ExecuteOptions::default()
        };
        let mut vars = Map::new();
        vars.insert("name".to_string(), json!("x"));
        let result = engine
            .execute(&plan("demo", vec![command("a", "touch ${name}")]), vars, &options)
            .expect("execute");

        assert!(result.success);
        assert!(result.transaction_id.is_none());
        assert!(result.step_results["a"].simulated);
        assert!(engine.transactions().transactions(None).expect("list").is_empty());
    }

    #[test]
    fn execute_request_runs_the_planned_file() {
        let (temp, engine) = temp_engine();
        let handler = ScriptedHandler::succeeding();
        let engine = engine.with_handlers(scripted_table(handler.clone()));
        let plans = temp.path().join("plans");
        std::fs::create_dir_all(&plans).expect("mkdir");
        write_plan(
            &plans.join("deploy.json"),
            &plan(
                "deploy",
                vec![command("build", "build"), with_deps(command("ship", "ship"), &["build"])],
            ),
        )
        .expect("write plan");

        let result = engine
            .execute_request(
                &FilePlanner::new(&plans),
                " deploy.json\n",
                Map::new(),
                &ExecuteOptions::default(),
            )
            .expect("execute");

        assert!(result.success);
        assert_eq!(result.plan_id, "deploy");
        assert_eq!(handler.started(), vec!["build".to_string(), "ship".to_string()]);
        assert!(result.transaction_id.is_some());
    }

    #[test]
    fn execute_request_reports_missing_plan() {
        let (temp, engine) = temp_engine();
        let err = engine
            .execute_request(
                &FilePlanner::new(temp.path()),
                "absent.json",
                Map::new(),
                &ExecuteOptions::default(),
            )
            .expect_err("missing plan");
        assert!(format!("{err:#}").contains("absent.json"), "{err:#}");
        assert!(engine.transactions().transactions(None).expect("list").is_empty());
    }
}
