//! Plan execution CLI.
//!
//! Validates and runs JSON plans against a state root (`.stepwise/` under
//! `--root`), lists the operation history and rolls back operations or whole
//! transactions. Every command prints JSON on stdout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value, json};

use stepwise::engine::Engine;
use stepwise::error::RollbackError;
use stepwise::exit_codes;
use stepwise::io::oplog::OperationFilter;
use stepwise::io::plan_store::{load_plan, validate_plan_file};
use stepwise::io::rollback::{OperationRollback, TransactionRollback};
use stepwise::logging;
use stepwise::scheduler::ExecuteOptions;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Transactional plan execution engine")]
struct Cli {
    /// Directory holding `.stepwise/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a plan file: schema, parameters, dependency graph.
    Validate { plan: PathBuf },
    /// Execute a plan file.
    Run {
        plan: PathBuf,
        /// Initial variable `key=value`; the value is parsed as JSON when possible.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// JSON object of initial variables (applied before `--var`).
        #[arg(long)]
        vars_file: Option<PathBuf>,
        /// Simulate mutating steps; no transaction is recorded.
        #[arg(long)]
        dry_run: bool,
        /// Append to this open transaction.
        #[arg(long)]
        transaction: Option<String>,
        /// Working directory for relative paths (defaults to the root).
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// List recorded operations, most recent last.
    History {
        #[arg(long)]
        transaction: Option<String>,
        #[arg(long)]
        step: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List transactions, most recent first.
    Transactions {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Undo recorded operations.
    Rollback {
        #[command(subcommand)]
        target: RollbackTarget,
    },
}

#[derive(Subcommand)]
enum RollbackTarget {
    /// One operation by record id.
    Op { id: String },
    /// A whole transaction by id.
    Tx { id: String },
    /// The most recent transaction that is not fully rolled back.
    Last,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { plan } => cmd_validate(&plan),
        Command::Run {
            plan,
            vars,
            vars_file,
            dry_run,
            transaction,
            workdir,
        } => {
            let mut initial = match vars_file {
                Some(path) => read_vars_file(&path)?,
                None => Map::new(),
            };
            for raw in &vars {
                let (key, value) = parse_var(raw)?;
                initial.insert(key, value);
            }
            let options = ExecuteOptions {
                dry_run,
                transaction_id: transaction,
                workdir,
            };
            cmd_run(&cli.root, &plan, initial, &options)
        }
        Command::History {
            transaction,
            step,
            limit,
        } => {
            let engine = Engine::open(&cli.root)?;
            let entries = engine.transactions().list(&OperationFilter {
                transaction_id: transaction,
                step_id: step,
                limit,
            })?;
            print_json(&entries)?;
            Ok(exit_codes::OK)
        }
        Command::Transactions { limit } => {
            let engine = Engine::open(&cli.root)?;
            print_json(&engine.transactions().transactions(limit)?)?;
            Ok(exit_codes::OK)
        }
        Command::Rollback { target } => cmd_rollback(&cli.root, &target),
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let (plan, graph) = validate_plan_file(path)?;
    print_json(&json!({
        "plan_id": plan.id,
        "steps": plan.steps.len(),
        "order": graph.order(),
        "entry_points": graph.entry_points(),
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_run(
    root: &Path,
    plan_path: &Path,
    initial: Map<String, Value>,
    options: &ExecuteOptions,
) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    let engine = Engine::open(root)?;
    let result = engine.execute(&plan, initial, options)?;
    print_json(&result)?;
    Ok(if result.success {
        exit_codes::OK
    } else {
        exit_codes::PLAN_FAILED
    })
}

fn cmd_rollback(root: &Path, target: &RollbackTarget) -> Result<i32> {
    let engine = Engine::open(root)?;
    let transactions = engine.transactions();
    let outcome = match target {
        RollbackTarget::Op { id } => {
            let outcome = transactions.rollback_operation(id)?;
            print_json(&json!({"record_id": id, "outcome": outcome}))?;
            return Ok(if outcome == OperationRollback::NonReversible {
                exit_codes::PARTIAL_ROLLBACK
            } else {
                exit_codes::OK
            });
        }
        RollbackTarget::Tx { id } => transactions.rollback_transaction(id),
        RollbackTarget::Last => transactions.rollback_last(),
    };
    match outcome {
        Ok(report) => {
            print_json(&report)?;
            Ok(rollback_exit_code(&report))
        }
        Err(RollbackError::Halted { report, source }) => {
            print_json(&report)?;
            eprintln!("rollback halted: {source}");
            Ok(exit_codes::PARTIAL_ROLLBACK)
        }
        Err(err) => Err(err.into()),
    }
}

fn rollback_exit_code(report: &TransactionRollback) -> i32 {
    if report.non_reversible.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::PARTIAL_ROLLBACK
    }
}

fn read_vars_file(path: &Path) -> Result<Map<String, Value>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

/// `key=value`; the value is JSON when it parses, a plain string otherwise.
fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --var {raw:?}: expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("invalid --var {raw:?}: empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
