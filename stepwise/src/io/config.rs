//! Engine configuration stored under `.stepwise/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum steps (or parallel loop iterations) in flight per scope.
    pub max_workers: usize,

    /// Timeout for Command, Code and Api steps without `timeout_secs`.
    pub default_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Upper bound on the resolved item count of a Loop step.
    pub max_loop_iterations: usize,

    pub code: CodeConfig,
    pub http: HttpConfig,
    pub recovery: RecoveryConfig,
}

/// Interpreter commands for Code steps; the snippet path is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodeConfig {
    pub python: Vec<String>,
    pub shell: Vec<String>,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            python: vec!["python3".to_string()],
            shell: vec!["sh".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("stepwise/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Record recovery outcomes and rank retry/skip by them.
    pub learn: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { learn: true }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
            max_loop_iterations: 10_000,
            code: CodeConfig::default(),
            http: HttpConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.default_timeout_secs == 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_loop_iterations == 0 {
            return Err(anyhow!("max_loop_iterations must be > 0"));
        }
        for (name, command) in [("code.python", &self.code.python), ("code.shell", &self.code.shell)] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.max_workers = 2;
        cfg.code.python = vec!["python3.12".to_string(), "-I".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_workers = 8\n[recovery]\nlearn = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_workers, 8);
        assert!(!cfg.recovery.learn);
        assert_eq!(cfg.code, CodeConfig::default());
    }

    #[test]
    fn rejects_zero_workers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_workers = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("max_workers"));
    }
}
