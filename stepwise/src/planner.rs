//! Plan producers.
//!
//! Turning a request into a plan is outside the engine; it only depends on this
//! trait, chosen when the caller wires things up.

use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use crate::io::plan_store::load_plan;
use crate::plan::TaskPlan;

pub trait Planner {
    fn plan(&self, request: &str) -> Result<TaskPlan>;
}

/// Treats the request as a JSON plan file path, relative to `base`.
#[derive(Debug, Clone)]
pub struct FilePlanner {
    base: PathBuf,
}

impl FilePlanner {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Planner for FilePlanner {
    fn plan(&self, request: &str) -> Result<TaskPlan> {
        let path = self.base.join(request.trim());
        debug!(path = %path.display(), "loading plan");
        load_plan(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::plan_store::write_plan;
    use crate::test_support::{command, plan};

    #[test]
    fn loads_plan_relative_to_base() {
        let temp = tempfile::tempdir().expect("tempdir");
        let original = plan("demo", vec![command("a", "echo hi")]);
        write_plan(&temp.path().join("demo.json"), &original).expect("write");

        let loaded = FilePlanner::new(temp.path()).plan("demo.json").expect("plan");
        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = FilePlanner::new(temp.path()).plan("nope.json").expect_err("missing");
        assert!(format!("{err:#}").contains("nope.json"));
    }
}
