//! Canonical paths within `.stepwise/`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// All canonical paths within `.stepwise/` for a state root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub history_dir: PathBuf,
    pub operations_path: PathBuf,
    pub transactions_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub recovery_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".stepwise");
        let history_dir = state_dir.join("history");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            history_dir: history_dir.clone(),
            operations_path: history_dir.join("operations.jsonl"),
            transactions_dir: history_dir.join("transactions"),
            backups_dir: state_dir.join("backups"),
            runs_dir: state_dir.join("runs"),
            recovery_path: state_dir.join("recovery.json"),
        }
    }

    /// Create the directory skeleton (idempotent).
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.history_dir,
            &self.transactions_dir,
            &self.backups_dir,
            &self.runs_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StatePaths::new(temp.path());
        assert!(paths.operations_path.ends_with(Path::new(".stepwise/history/operations.jsonl")));
        assert!(paths.transactions_dir.ends_with(Path::new(".stepwise/history/transactions")));
        assert!(paths.recovery_path.ends_with("recovery.json"));

        paths.ensure().expect("ensure");
        paths.ensure().expect("ensure twice");
        assert!(paths.backups_dir.is_dir());
        assert!(paths.runs_dir.is_dir());
    }
}
