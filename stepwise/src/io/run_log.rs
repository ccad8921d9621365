//! Run logging helpers for `.stepwise/runs/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::paths::StatePaths;
use super::write_json;
use crate::core::types::PlanResult;
use crate::plan::TaskPlan;

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub run_id: String,
    pub plan_id: String,
    pub success: bool,
    pub dry_run: bool,
    pub transaction_id: Option<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub plan_path: PathBuf,
    pub result_path: PathBuf,
}

impl RunPaths {
    pub fn new(paths: &StatePaths, run_id: &str) -> Self {
        let dir = paths.runs_dir.join(run_id);
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            plan_path: dir.join("plan.json"),
            result_path: dir.join("result.json"),
        }
    }
}

pub struct RunWriteRequest<'a> {
    pub paths: &'a StatePaths,
    pub meta: &'a RunMeta,
    pub plan: &'a TaskPlan,
    pub result: &'a PlanResult,
}

pub fn write_run(request: &RunWriteRequest<'_>) -> Result<RunPaths> {
    let paths = RunPaths::new(request.paths, &request.meta.run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.plan_path, request.plan)?;
    write_json(&paths.result_path, request.result)?;

    Ok(paths)
}

/// Load a previously written `result.json`.
pub fn read_result(path: &Path) -> Result<PlanResult> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command, plan};
    use std::collections::BTreeMap;

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(&StatePaths::new(temp.path()), "run-1");

        assert!(paths.dir.ends_with(Path::new(".stepwise/runs/run-1")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.plan_path.ends_with("plan.json"));
        assert!(paths.result_path.ends_with("result.json"));
    }

    #[test]
    fn writes_run_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(temp.path());
        let plan = plan("demo", vec![command("a", "true")]);
        let result = PlanResult {
            plan_id: "demo".to_string(),
            success: true,
            executed: vec!["a".to_string()],
            skipped: Vec::new(),
            step_results: BTreeMap::new(),
            variables: serde_json::Map::new(),
            failed_step: None,
            error: None,
            transaction_id: None,
            dry_run: true,
            duration_ms: 3,
        };
        let meta = RunMeta {
            run_id: "run-7".to_string(),
            plan_id: "demo".to_string(),
            success: true,
            dry_run: true,
            transaction_id: None,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: "2026-01-01T00:00:01Z".to_string(),
            duration_ms: 3,
        };

        let paths = write_run(&RunWriteRequest {
            paths: &state,
            meta: &meta,
            plan: &plan,
            result: &result,
        })
        .expect("write run");

        assert!(paths.meta_path.is_file());
        assert!(paths.plan_path.is_file());
        assert_eq!(read_result(&paths.result_path).expect("read"), result);
    }
}
