//! Append-only operation log grouped into transactions.
//!
//! Layout under `.stepwise/history/`:
//! - `operations.jsonl`: one line per operation record and one per rollback marker;
//! - `transactions/<id>.json`: transaction entry, rewritten atomically on change.
//!
//! Appends and sequence numbers are serialized under one lock per log.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::backup::BackupStore;
use super::ids::generate_id;
use super::paths::StatePaths;
use super::write_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
    PartiallyRolledBack,
}

/// State of a path before or after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PathState {
    Absent,
    /// Regular file; original bytes are in the backup store under `hash`.
    File { hash: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Filesystem,
    Content,
    Command,
}

/// Forward action plus what is needed to invert it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationAction {
    Filesystem {
        path: String,
        operation: String,
        pre: PathState,
        post: PathState,
        /// Directories created for the operation, outermost first.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        created_dirs: Vec<String>,
    },
    Content {
        path: String,
        edit: String,
        /// Hash of the full original text.
        original: String,
        post: String,
    },
    Command {
        command: String,
        workdir: String,
        /// Compensating command; `None` means manual / non-reversible.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compensation: Option<String>,
    },
}

impl OperationAction {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Filesystem { .. } => OperationKind::Filesystem,
            Self::Content { .. } => OperationKind::Content,
            Self::Command { .. } => OperationKind::Command,
        }
    }
}

/// Immutable log entry for one mutating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// `<transaction_id>:<sequence>`.
    pub id: String,
    pub transaction_id: String,
    pub sequence: u64,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: OperationAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub plan_id: String,
    pub status: TransactionStatus,
    /// Record ids in sequence order.
    pub records: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LogLine {
    Operation(OperationRecord),
    RolledBack {
        record_id: String,
        transaction_id: String,
        at: DateTime<Utc>,
    },
}

/// A record plus whether a rollback marker supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationEntry {
    #[serde(flatten)]
    pub record: OperationRecord,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub transaction_id: Option<String>,
    pub step_id: Option<String>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct OperationLog {
    operations_path: PathBuf,
    transactions_dir: PathBuf,
    backups: BackupStore,
    lock: Mutex<()>,
}

impl OperationLog {
    pub fn open(paths: &StatePaths) -> Result<Self> {
        paths.ensure()?;
        Ok(Self {
            operations_path: paths.operations_path.clone(),
            transactions_dir: paths.transactions_dir.clone(),
            backups: BackupStore::new(&paths.backups_dir),
            lock: Mutex::new(()),
        })
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    #[instrument(skip_all, fields(plan_id))]
    pub fn begin(&self, plan_id: &str) -> Result<Transaction> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let tx = Transaction {
            id: generate_id("tx"),
            plan_id: plan_id.to_string(),
            status: TransactionStatus::Open,
            records: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.write_transaction(&tx)?;
        info!(transaction_id = %tx.id, "transaction opened");
        Ok(tx)
    }

    /// Continue appending to an existing open transaction.
    pub fn resume(&self, transaction_id: &str) -> Result<Transaction> {
        let tx = self
            .transaction(transaction_id)?
            .ok_or_else(|| anyhow!("transaction {transaction_id} not found"))?;
        if tx.status != TransactionStatus::Open {
            bail!("transaction {transaction_id} is {:?}, not open", tx.status);
        }
        Ok(tx)
    }

    /// Append a record to an open transaction, assigning the next sequence number.
    #[instrument(skip_all, fields(transaction_id, step_id, kind = ?action.kind()))]
    pub fn append(
        &self,
        transaction_id: &str,
        step_id: &str,
        action: OperationAction,
    ) -> Result<OperationRecord> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tx = self
            .read_transaction(transaction_id)?
            .ok_or_else(|| anyhow!("transaction {transaction_id} not found"))?;
        if tx.status != TransactionStatus::Open {
            bail!("transaction {transaction_id} is {:?}, not open", tx.status);
        }
        let sequence = tx.records.len() as u64 + 1;
        let record = OperationRecord {
            id: format!("{transaction_id}:{sequence}"),
            transaction_id: transaction_id.to_string(),
            sequence,
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            action,
        };
        self.append_line(&LogLine::Operation(record.clone()))?;
        tx.records.push(record.id.clone());
        tx.updated_at = record.timestamp;
        self.write_transaction(&tx)?;
        debug!(record_id = %record.id, "operation recorded");
        Ok(record)
    }

    pub fn set_status(&self, transaction_id: &str, status: TransactionStatus) -> Result<Transaction> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tx = self
            .read_transaction(transaction_id)?
            .ok_or_else(|| anyhow!("transaction {transaction_id} not found"))?;
        tx.status = status;
        tx.updated_at = Utc::now();
        self.write_transaction(&tx)?;
        info!(transaction_id, ?status, "transaction status updated");
        Ok(tx)
    }

    /// Supersede a record with a rollback marker.
    pub fn mark_rolled_back(&self, record: &OperationRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.append_line(&LogLine::RolledBack {
            record_id: record.id.clone(),
            transaction_id: record.transaction_id.clone(),
            at: Utc::now(),
        })
    }

    pub fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_transaction(transaction_id)
    }

    /// Transactions, most recent first.
    pub fn transactions(&self, limit: Option<usize>) -> Result<Vec<Transaction>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        if !self.transactions_dir.exists() {
            return Ok(out);
        }
        let entries = fs::read_dir(&self.transactions_dir)
            .with_context(|| format!("read {}", self.transactions_dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("read {}", self.transactions_dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            out.push(read_transaction_file(&path)?);
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Records matching `filter`, oldest first.
    pub fn list(&self, filter: &OperationFilter) -> Result<Vec<OperationEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (records, rolled_back) = self.read_log()?;
        let mut out: Vec<OperationEntry> = records
            .into_iter()
            .filter(|record| {
                filter
                    .transaction_id
                    .as_ref()
                    .is_none_or(|tx| &record.transaction_id == tx)
                    && filter
                        .step_id
                        .as_ref()
                        .is_none_or(|step| &record.step_id == step)
            })
            .map(|record| OperationEntry {
                rolled_back: rolled_back.contains(&record.id),
                record,
            })
            .collect();
        if let Some(limit) = filter.limit
            && out.len() > limit
        {
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    pub fn find(&self, record_id: &str) -> Result<Option<OperationEntry>> {
        let transaction_id = record_id
            .rsplit_once(':')
            .map(|(tx, _)| tx.to_string());
        let entries = self.list(&OperationFilter {
            transaction_id,
            ..OperationFilter::default()
        })?;
        Ok(entries.into_iter().find(|entry| entry.record.id == record_id))
    }

    fn transaction_path(&self, transaction_id: &str) -> Option<PathBuf> {
        let safe = !transaction_id.is_empty()
            && transaction_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.transactions_dir.join(format!("{transaction_id}.json")))
    }

    fn read_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        match self.transaction_path(transaction_id) {
            Some(path) if path.exists() => read_transaction_file(&path).map(Some),
            _ => Ok(None),
        }
    }

    fn write_transaction(&self, tx: &Transaction) -> Result<()> {
        let path = self
            .transaction_path(&tx.id)
            .ok_or_else(|| anyhow!("invalid transaction id {}", tx.id))?;
        write_json(&path, tx)
    }

    fn append_line(&self, line: &LogLine) -> Result<()> {
        let mut buf = serde_json::to_string(line).context("serialize operation log line")?;
        buf.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.operations_path)
            .with_context(|| format!("open {}", self.operations_path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", self.operations_path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync {}", self.operations_path.display()))?;
        Ok(())
    }

    fn read_log(&self) -> Result<(Vec<OperationRecord>, BTreeSet<String>)> {
        let mut records = Vec::new();
        let mut rolled_back = BTreeSet::new();
        if !self.operations_path.exists() {
            return Ok((records, rolled_back));
        }
        let contents = fs::read_to_string(&self.operations_path)
            .with_context(|| format!("read {}", self.operations_path.display()))?;
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = serde_json::from_str(line).with_context(|| {
                format!("parse {} line {}", self.operations_path.display(), index + 1)
            })?;
            match parsed {
                LogLine::Operation(record) => records.push(record),
                LogLine::RolledBack { record_id, .. } => {
                    rolled_back.insert(record_id);
                }
            }
        }
        Ok((records, rolled_back))
    }
}

fn read_transaction_file(path: &Path) -> Result<Transaction> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Write handle for the transaction of one run.
#[derive(Debug, Clone, Copy)]
pub struct Journal<'a> {
    log: &'a OperationLog,
    transaction_id: &'a str,
}

impl<'a> Journal<'a> {
    pub fn new(log: &'a OperationLog, transaction_id: &'a str) -> Self {
        Self {
            log,
            transaction_id,
        }
    }

    pub fn record(&self, step_id: &str, action: OperationAction) -> Result<OperationRecord> {
        self.log.append(self.transaction_id, step_id, action)
    }

    /// Snapshot bytes into the backup store.
    pub fn backup(&self, bytes: &[u8]) -> Result<String> {
        self.log.backups().put(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_action(command: &str) -> OperationAction {
        OperationAction::Command {
            command: command.to_string(),
            workdir: "/tmp".to_string(),
            compensation: None,
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OperationLog::open(&StatePaths::new(temp.path())).expect("open");
        let tx = log.begin("plan").expect("begin");

        let first = log.append(&tx.id, "a", command_action("one")).expect("append");
        let second = log.append(&tx.id, "b", command_action("two")).expect("append");
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.id, format!("{}:2", tx.id));

        let stored = log.transaction(&tx.id).expect("read").expect("exists");
        assert_eq!(stored.records, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(stored.status, TransactionStatus::Open);
    }

    #[test]
    fn filters_by_transaction_step_and_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OperationLog::open(&StatePaths::new(temp.path())).expect("open");
        let tx1 = log.begin("p1").expect("begin");
        let tx2 = log.begin("p2").expect("begin");
        log.append(&tx1.id, "a", command_action("1")).expect("append");
        log.append(&tx2.id, "a", command_action("2")).expect("append");
        log.append(&tx2.id, "b", command_action("3")).expect("append");

        let by_tx = log
            .list(&OperationFilter {
                transaction_id: Some(tx2.id.clone()),
                ..OperationFilter::default()
            })
            .expect("list");
        assert_eq!(by_tx.len(), 2);

        let by_step = log
            .list(&OperationFilter {
                step_id: Some("a".to_string()),
                ..OperationFilter::default()
            })
            .expect("list");
        assert_eq!(by_step.len(), 2);

        let recent = log
            .list(&OperationFilter {
                limit: Some(1),
                ..OperationFilter::default()
            })
            .expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record.step_id, "b");
    }

    #[test]
    fn rollback_marker_supersedes_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OperationLog::open(&StatePaths::new(temp.path())).expect("open");
        let tx = log.begin("p").expect("begin");
        let record = log.append(&tx.id, "a", command_action("x")).expect("append");
        log.mark_rolled_back(&record).expect("mark");

        let entry = log.find(&record.id).expect("find").expect("exists");
        assert!(entry.rolled_back);
    }

    #[test]
    fn closed_transactions_reject_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OperationLog::open(&StatePaths::new(temp.path())).expect("open");
        let tx = log.begin("p").expect("begin");
        log.set_status(&tx.id, TransactionStatus::Committed)
            .expect("commit");
        assert!(log.append(&tx.id, "a", command_action("x")).is_err());
        assert!(log.resume(&tx.id).is_err());
    }

    #[test]
    fn unknown_or_unsafe_transaction_ids_are_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OperationLog::open(&StatePaths::new(temp.path())).expect("open");
        assert!(log.transaction("tx-missing").expect("read").is_none());
        assert!(log.transaction("../config").expect("read").is_none());
    }
}
