//! Transactional rollback of executed plans.
//!
//! Each test runs a plan through the engine, then inverts its journal with the
//! transaction manager and checks the filesystem is back where it started.
#![cfg(unix)]

use std::fs;

use serde_json::{Map, Value, json};

use stepwise::error::RollbackError;
use stepwise::io::oplog::{OperationFilter, OperationKind, TransactionStatus};
use stepwise::io::plan_store::parse_plan;
use stepwise::io::rollback::OperationRollback;
use stepwise::plan::TaskPlan;
use stepwise::scheduler::ExecuteOptions;
use stepwise::test_support::temp_engine;

fn plan(doc: Value) -> TaskPlan {
    parse_plan(&doc.to_string()).expect("parse plan")
}

#[test]
fn write_then_read_then_rollback_deletes_output() {
    let (temp, engine) = temp_engine();
    let plan = plan(json!({
        "id": "hello",
        "steps": [
            {"id": "write", "type": "file",
             "params": {"operation": "write", "path": "out.txt", "content": "hello"}},
            {"id": "read", "type": "command", "params": {"command": "cat out.txt"},
             "depends_on": ["write"]}
        ]
    }));

    let result = engine
        .execute(&plan, Map::new(), &ExecuteOptions::default())
        .expect("execute");
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.step_results["read"].stdout.as_deref(), Some("hello"));
    let out = temp.path().join("out.txt");
    assert!(out.exists());

    let tx_id = result.transaction_id.expect("transaction");
    let report = engine
        .transactions()
        .rollback_transaction(&tx_id)
        .expect("rollback");

    assert!(!out.exists());
    // `cat` has no undo, so it stays applied.
    assert_eq!(report.reverted.len(), 1);
    assert_eq!(report.non_reversible.len(), 1);
    assert_eq!(report.status, TransactionStatus::PartiallyRolledBack);
}

#[test]
fn single_operation_rollback_restores_exact_bytes() {
    let (temp, engine) = temp_engine();
    let target = temp.path().join("config.ini");
    fs::write(&target, b"mode=old\n\x00binary tail").expect("seed");
    let plan = plan(json!({
        "id": "overwrite",
        "steps": [
            {"id": "update", "type": "file",
             "params": {"operation": "write", "path": "config.ini", "content": "mode=new\n"}}
        ]
    }));

    let result = engine
        .execute(&plan, Map::new(), &ExecuteOptions::default())
        .expect("execute");
    assert_eq!(fs::read_to_string(&target).expect("read"), "mode=new\n");

    let entries = engine
        .transactions()
        .list(&OperationFilter {
            step_id: Some("update".to_string()),
            ..OperationFilter::default()
        })
        .expect("history");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.action.kind(), OperationKind::Filesystem);
    assert_eq!(
        Some(entries[0].record.transaction_id.clone()),
        result.transaction_id
    );

    let outcome = engine
        .transactions()
        .rollback_operation(&entries[0].record.id)
        .expect("rollback");
    assert_eq!(outcome, OperationRollback::Reverted);
    assert_eq!(fs::read(&target).expect("read"), b"mode=old\n\x00binary tail");

    let again = engine
        .transactions()
        .rollback_operation(&entries[0].record.id)
        .expect_err("already rolled back");
    assert!(matches!(again, RollbackError::AlreadyRolledBack { .. }));
}

#[test]
fn transaction_rollback_restores_pre_run_state() {
    let (temp, engine) = temp_engine();
    let root = temp.path();
    fs::write(root.join("notes.txt"), "alpha beta alpha\n").expect("seed");
    fs::write(root.join("old.log"), "keep me").expect("seed");
    fs::write(root.join("src.txt"), "source").expect("seed");
    let plan = plan(json!({
        "id": "mixed",
        "steps": [
            {"id": "create", "type": "file",
             "params": {"operation": "write", "path": "new/dir/fresh.txt", "content": "fresh"}},
            {"id": "edit", "type": "file",
             "params": {"operation": "replace", "path": "notes.txt", "find": "alpha", "replace": "omega"}},
            {"id": "append", "type": "file", "depends_on": ["edit"],
             "params": {"operation": "append", "path": "notes.txt", "content": "gamma\n"}},
            {"id": "remove", "type": "file",
             "params": {"operation": "delete", "path": "old.log"}},
            {"id": "relocate", "type": "file",
             "params": {"operation": "move", "from": "src.txt", "to": "moved.txt"}},
            {"id": "mkdir", "type": "command",
             "params": {"command": "mkdir made", "undo": "rmdir made"}}
        ]
    }));

    let result = engine
        .execute(&plan, Map::new(), &ExecuteOptions::default())
        .expect("execute");
    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        fs::read_to_string(root.join("notes.txt")).expect("read"),
        "omega beta omega\ngamma\n"
    );
    assert!(root.join("made").is_dir());

    let report = engine.transactions().rollback_last().expect("rollback");

    assert_eq!(report.status, TransactionStatus::RolledBack);
    assert!(report.non_reversible.is_empty());
    assert!(report.remaining.is_empty());
    assert!(!root.join("new").exists());
    assert_eq!(
        fs::read_to_string(root.join("notes.txt")).expect("read"),
        "alpha beta alpha\n"
    );
    assert_eq!(fs::read_to_string(root.join("old.log")).expect("read"), "keep me");
    assert_eq!(fs::read_to_string(root.join("src.txt")).expect("read"), "source");
    assert!(!root.join("moved.txt").exists());
    assert!(!root.join("made").exists());

    let tx = engine
        .transactions()
        .transactions(Some(1))
        .expect("list")
        .remove(0);
    assert_eq!(tx.status, TransactionStatus::RolledBack);
}

#[test]
fn drifted_file_halts_rollback_with_remaining_records() {
    let (temp, engine) = temp_engine();
    let plan = plan(json!({
        "id": "drift",
        "steps": [
            {"id": "first", "type": "file",
             "params": {"operation": "write", "path": "a.txt", "content": "one"}},
            {"id": "second", "type": "file", "depends_on": ["first"],
             "params": {"operation": "write", "path": "b.txt", "content": "two"}}
        ]
    }));
    let result = engine
        .execute(&plan, Map::new(), &ExecuteOptions::default())
        .expect("execute");
    fs::write(temp.path().join("b.txt"), "edited by hand").expect("drift");

    let err = engine
        .transactions()
        .rollback_transaction(&result.transaction_id.expect("transaction"))
        .expect_err("drift");
    let RollbackError::Halted { report, .. } = err else {
        panic!("expected halted rollback, got {err}");
    };
    assert_eq!(report.status, TransactionStatus::PartiallyRolledBack);
    assert!(report.reverted.is_empty());
    assert_eq!(report.remaining.len(), 2);
    assert!(temp.path().join("a.txt").exists());
}

#[test]
fn dry_run_changes_nothing_and_records_nothing() {
    let (temp, engine) = temp_engine();
    let plan = plan(json!({
        "id": "dry",
        "steps": [
            {"id": "write", "type": "file",
             "params": {"operation": "write", "path": "out.txt", "content": "hello"}},
            {"id": "touch", "type": "command", "params": {"command": "touch marker"}}
        ]
    }));
    let options = ExecuteOptions {
        dry_run: true,
        ..ExecuteOptions::default()
    };

    let result = engine.execute(&plan, Map::new(), &options).expect("execute");

    assert!(result.success);
    assert!(result.dry_run);
    assert!(result.step_results.values().all(|step| step.simulated));
    assert!(!temp.path().join("out.txt").exists());
    assert!(!temp.path().join("marker").exists());
    assert!(
        engine
            .transactions()
            .list(&OperationFilter::default())
            .expect("history")
            .is_empty()
    );
}
