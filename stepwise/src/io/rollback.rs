//! Rollback of logged operations.
//!
//! Filesystem and Content records restore their pre-state from the backup store,
//! after checking that the path still holds the recorded post-state. Command
//! records run their compensating command; without one they are reported as
//! non-reversible and stay applied.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::backup::content_hash;
use super::oplog::{
    OperationAction, OperationEntry, OperationFilter, OperationLog, OperationRecord, PathState,
    Transaction, TransactionStatus,
};
use super::process::{run_command_with_timeout, shell_command};
use crate::error::RollbackError;

/// Result of inverting one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationRollback {
    Reverted,
    /// The path already held its pre-state.
    AlreadyReverted,
    NonReversible,
}

/// Outcome of rolling back a whole transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRollback {
    pub transaction_id: String,
    pub status: TransactionStatus,
    /// Inverted record ids, in inversion order.
    pub reverted: Vec<String>,
    /// Command records without a compensating command.
    pub non_reversible: Vec<String>,
    /// Record ids still applied after this rollback, newest first.
    pub remaining: Vec<String>,
}

/// Rollback surface over the operation log.
#[derive(Debug)]
pub struct TransactionManager {
    log: OperationLog,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl TransactionManager {
    pub fn new(log: OperationLog, command_timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            log,
            command_timeout,
            output_limit_bytes,
        }
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn list(&self, filter: &OperationFilter) -> Result<Vec<OperationEntry>> {
        self.log.list(filter)
    }

    pub fn transactions(&self, limit: Option<usize>) -> Result<Vec<Transaction>> {
        self.log.transactions(limit)
    }

    /// Invert a single operation.
    #[instrument(skip_all, fields(record_id))]
    pub fn rollback_operation(&self, record_id: &str) -> Result<OperationRollback, RollbackError> {
        let entry = self
            .log
            .find(record_id)?
            .ok_or_else(|| RollbackError::UnknownRecord {
                record_id: record_id.to_string(),
            })?;
        if entry.rolled_back {
            return Err(RollbackError::AlreadyRolledBack {
                record_id: record_id.to_string(),
            });
        }
        let outcome = self.invert(&entry.record)?;
        if outcome != OperationRollback::NonReversible {
            self.log.mark_rolled_back(&entry.record)?;
            let remaining = self
                .log
                .list(&OperationFilter {
                    transaction_id: Some(entry.record.transaction_id.clone()),
                    ..OperationFilter::default()
                })?
                .into_iter()
                .filter(|e| !e.rolled_back)
                .count();
            let status = if remaining == 0 {
                TransactionStatus::RolledBack
            } else {
                TransactionStatus::PartiallyRolledBack
            };
            self.log
                .set_status(&entry.record.transaction_id, status)?;
        }
        info!(?outcome, "operation rolled back");
        Ok(outcome)
    }

    /// Invert every applied record of a transaction, newest first.
    ///
    /// Stops at the first inversion failure and returns [`RollbackError::Halted`]
    /// with the partial state.
    #[instrument(skip_all, fields(transaction_id))]
    pub fn rollback_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionRollback, RollbackError> {
        if self.log.transaction(transaction_id)?.is_none() {
            return Err(RollbackError::UnknownTransaction {
                transaction_id: transaction_id.to_string(),
            });
        }
        let entries = self.log.list(&OperationFilter {
            transaction_id: Some(transaction_id.to_string()),
            ..OperationFilter::default()
        })?;
        let pending: Vec<&OperationRecord> = entries
            .iter()
            .rev()
            .filter(|entry| !entry.rolled_back)
            .map(|entry| &entry.record)
            .collect();

        let mut report = TransactionRollback {
            transaction_id: transaction_id.to_string(),
            status: TransactionStatus::RolledBack,
            reverted: Vec::new(),
            non_reversible: Vec::new(),
            remaining: Vec::new(),
        };
        for (index, record) in pending.iter().enumerate() {
            match self.invert(record) {
                Ok(OperationRollback::NonReversible) => {
                    warn!(record_id = %record.id, "operation is not reversible");
                    report.non_reversible.push(record.id.clone());
                }
                Ok(_) => {
                    self.log.mark_rolled_back(record)?;
                    report.reverted.push(record.id.clone());
                }
                Err(err) => {
                    warn!(record_id = %record.id, err = %err, "rollback halted");
                    report.remaining = report.non_reversible.clone();
                    report
                        .remaining
                        .extend(pending[index..].iter().map(|r| r.id.clone()));
                    report.status = TransactionStatus::PartiallyRolledBack;
                    self.log.set_status(transaction_id, report.status)?;
                    return Err(RollbackError::Halted {
                        report: Box::new(report),
                        source: Box::new(err),
                    });
                }
            }
        }
        report.remaining = report.non_reversible.clone();
        report.status = if report.non_reversible.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::PartiallyRolledBack
        };
        self.log.set_status(transaction_id, report.status)?;
        info!(
            reverted = report.reverted.len(),
            non_reversible = report.non_reversible.len(),
            "transaction rolled back"
        );
        Ok(report)
    }

    /// Roll back the most recent transaction that is not fully rolled back.
    pub fn rollback_last(&self) -> Result<TransactionRollback, RollbackError> {
        let last = self
            .log
            .transactions(None)?
            .into_iter()
            .find(|tx| tx.status != TransactionStatus::RolledBack)
            .ok_or(RollbackError::NothingToRollBack)?;
        self.rollback_transaction(&last.id)
    }

    fn invert(&self, record: &OperationRecord) -> Result<OperationRollback, RollbackError> {
        debug!(record_id = %record.id, kind = ?record.action.kind(), "inverting operation");
        match &record.action {
            OperationAction::Filesystem {
                path,
                pre,
                post,
                created_dirs,
                ..
            } => {
                let outcome = self.restore(record, Path::new(path), pre, post)?;
                remove_created_dirs(created_dirs);
                Ok(outcome)
            }
            OperationAction::Content {
                path,
                original,
                post,
                ..
            } => self.restore(
                record,
                Path::new(path),
                &PathState::File {
                    hash: original.clone(),
                },
                &PathState::File { hash: post.clone() },
            ),
            OperationAction::Command {
                workdir,
                compensation,
                ..
            } => match compensation {
                Some(undo) => self.compensate(record, undo, Path::new(workdir)),
                None => Ok(OperationRollback::NonReversible),
            },
        }
    }

    fn restore(
        &self,
        record: &OperationRecord,
        path: &Path,
        pre: &PathState,
        post: &PathState,
    ) -> Result<OperationRollback, RollbackError> {
        let restore_err = |err: anyhow::Error| RollbackError::Restore {
            record_id: record.id.clone(),
            message: format!("{err:#}"),
        };
        let current = current_state(path).map_err(restore_err)?;
        if &current == pre {
            return Ok(OperationRollback::AlreadyReverted);
        }
        if &current != post {
            return Err(RollbackError::Drifted {
                record_id: record.id.clone(),
                path: path.display().to_string(),
            });
        }
        match pre {
            PathState::Absent => fs::remove_file(path)
                .with_context(|| format!("remove {}", path.display()))
                .map_err(restore_err)?,
            PathState::File { hash } => {
                let bytes = self.log.backups().get(hash).map_err(restore_err)?;
                write_bytes_atomic(path, &bytes).map_err(restore_err)?;
            }
        }
        Ok(OperationRollback::Reverted)
    }

    fn compensate(
        &self,
        record: &OperationRecord,
        undo: &str,
        workdir: &Path,
    ) -> Result<OperationRollback, RollbackError> {
        let mut cmd = shell_command(undo);
        cmd.current_dir(workdir);
        let output =
            run_command_with_timeout(cmd, None, self.command_timeout, self.output_limit_bytes)
                .map_err(|err| RollbackError::CompensationFailed {
                    record_id: record.id.clone(),
                    message: format!("{err:#}"),
                })?;
        if output.timed_out || !output.status.success() {
            let stderr = output.stderr_text();
            return Err(RollbackError::CompensationFailed {
                record_id: record.id.clone(),
                message: if output.timed_out {
                    "timed out".to_string()
                } else {
                    format!("exit {:?}: {}", output.status.code(), stderr.trim())
                },
            });
        }
        Ok(OperationRollback::Reverted)
    }
}

/// Hash-level state of a path; directories are not supported.
pub fn current_state(path: &Path) -> Result<PathState> {
    if !path.exists() {
        return Ok(PathState::Absent);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(PathState::File {
        hash: content_hash(&bytes),
    })
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".stepwise-tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn remove_created_dirs(created_dirs: &[String]) {
    for dir in created_dirs.iter().rev().map(PathBuf::from) {
        if let Err(err) = fs::remove_dir(&dir) {
            debug!(dir = %dir.display(), err = %err, "left created directory in place");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oplog::Journal;
    use crate::io::paths::StatePaths;

    fn manager(root: &Path) -> TransactionManager {
        let log = OperationLog::open(&StatePaths::new(root)).expect("open log");
        TransactionManager::new(log, Duration::from_secs(10), 10_000)
    }

    fn record_write(manager: &TransactionManager, tx: &str, path: &Path, content: &str) -> OperationRecord {
        let journal = Journal::new(manager.log(), tx);
        let pre = match fs::read(path) {
            Ok(bytes) => PathState::File {
                hash: journal.backup(&bytes).expect("backup"),
            },
            Err(_) => PathState::Absent,
        };
        let record = journal
            .record(
                "write",
                OperationAction::Filesystem {
                    path: path.display().to_string(),
                    operation: "write".to_string(),
                    pre,
                    post: PathState::File {
                        hash: content_hash(content.as_bytes()),
                    },
                    created_dirs: Vec::new(),
                },
            )
            .expect("record");
        fs::write(path, content).expect("apply");
        record
    }

    #[test]
    fn single_operation_rollback_restores_pre_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());
        let tx = manager.log().begin("p").expect("begin");
        let target = temp.path().join("notes.txt");
        fs::write(&target, "before").expect("seed");

        let record = record_write(&manager, &tx.id, &target, "after");
        assert_eq!(
            manager.rollback_operation(&record.id).expect("rollback"),
            OperationRollback::Reverted
        );
        assert_eq!(fs::read_to_string(&target).expect("read"), "before");
        assert!(matches!(
            manager.rollback_operation(&record.id),
            Err(RollbackError::AlreadyRolledBack { .. })
        ));
        let tx = manager.log().transaction(&tx.id).expect("read").expect("tx");
        assert_eq!(tx.status, TransactionStatus::RolledBack);
    }

    #[test]
    fn transaction_rollback_runs_newest_first_and_reports_non_reversible() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());
        let tx = manager.log().begin("p").expect("begin");
        let target = temp.path().join("out.txt");

        record_write(&manager, &tx.id, &target, "one");
        record_write(&manager, &tx.id, &target, "two");
        let journal = Journal::new(manager.log(), &tx.id);
        let manual = journal
            .record(
                "notify",
                OperationAction::Command {
                    command: "echo sent".to_string(),
                    workdir: temp.path().display().to_string(),
                    compensation: None,
                },
            )
            .expect("record");

        let report = manager.rollback_transaction(&tx.id).expect("rollback");
        assert!(!target.exists());
        assert_eq!(report.reverted.len(), 2);
        assert_eq!(report.non_reversible, vec![manual.id.clone()]);
        assert_eq!(report.remaining, vec![manual.id]);
        assert_eq!(report.status, TransactionStatus::PartiallyRolledBack);
    }

    #[test]
    fn drift_halts_transaction_rollback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());
        let tx = manager.log().begin("p").expect("begin");
        let first = temp.path().join("a.txt");
        let second = temp.path().join("b.txt");
        let kept = record_write(&manager, &tx.id, &first, "a");
        let drifted = record_write(&manager, &tx.id, &second, "b");
        fs::write(&second, "edited by hand").expect("drift");

        let err = manager.rollback_transaction(&tx.id).expect_err("halt");
        let RollbackError::Halted { report, source } = err else {
            panic!("expected halted rollback");
        };
        assert!(matches!(*source, RollbackError::Drifted { .. }));
        assert_eq!(report.remaining, vec![drifted.id, kept.id]);
        assert!(first.exists());
        assert_eq!(report.status, TransactionStatus::PartiallyRolledBack);
    }

    #[cfg(unix)]
    #[test]
    fn compensating_command_runs_in_recorded_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());
        let tx = manager.log().begin("p").expect("begin");
        fs::write(temp.path().join("created.txt"), "x").expect("seed");
        let record = Journal::new(manager.log(), &tx.id)
            .record(
                "make",
                OperationAction::Command {
                    command: "touch created.txt".to_string(),
                    workdir: temp.path().display().to_string(),
                    compensation: Some("rm created.txt".to_string()),
                },
            )
            .expect("record");

        assert_eq!(
            manager.rollback_operation(&record.id).expect("rollback"),
            OperationRollback::Reverted
        );
        assert!(!temp.path().join("created.txt").exists());
    }

    #[test]
    fn rollback_last_picks_most_recent_open_transaction() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());
        assert!(matches!(
            manager.rollback_last(),
            Err(RollbackError::NothingToRollBack)
        ));
        let tx = manager.log().begin("p").expect("begin");
        let target = temp.path().join("x.txt");
        record_write(&manager, &tx.id, &target, "x");

        let report = manager.rollback_last().expect("rollback");
        assert_eq!(report.transaction_id, tx.id);
        assert!(!target.exists());
    }
}
