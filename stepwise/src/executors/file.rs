//! File steps: read, write, append, replace, delete, copy and move.
//!
//! Every mutating operation captures the pre-state of each path it changes,
//! appends the operation record, and only then touches the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use super::{ExecContext, Handler, StepAttempt, StepOutput};
use crate::core::resolve::resolve_string;
use crate::error::StepError;
use crate::io::backup::content_hash;
use crate::io::oplog::{OperationAction, PathState};
use crate::io::rollback::write_bytes_atomic;
use crate::plan::FileParams;

#[derive(Debug, Clone, Copy, Default)]
pub struct FileHandler;

impl Handler<FileParams> for FileHandler {
    #[instrument(skip_all, fields(step_id = %ctx.step.id, operation = params.operation()))]
    fn run(&self, params: &FileParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let op = FileOp { ctx };
        let resolve = |raw: &str| -> Result<String, StepError> { Ok(resolve_string(raw, ctx.store)?) };
        let output = match params {
            FileParams::Read { path } => op.read(&resolve(path)?)?,
            FileParams::Write { path, content } => {
                op.write(&resolve(path)?, &resolve(content)?, "write")?
            }
            FileParams::Append { path, content } => op.append(&resolve(path)?, &resolve(content)?)?,
            FileParams::Replace {
                path,
                find,
                replace,
                count,
            } => op.replace(&resolve(path)?, &resolve(find)?, &resolve(replace)?, *count)?,
            FileParams::Delete { path } => op.delete(&resolve(path)?)?,
            FileParams::Copy { from, to } => op.copy(&resolve(from)?, &resolve(to)?)?,
            FileParams::Move { from, to } => op.rename(&resolve(from)?, &resolve(to)?)?,
        };
        Ok(output.field("operation", params.operation()))
    }
}

struct FileOp<'c, 'a> {
    ctx: &'c ExecContext<'a>,
}

impl FileOp<'_, '_> {
    fn target(&self, raw: &str) -> Result<PathBuf, StepError> {
        let path = std::path::absolute(self.ctx.path(raw))
            .map_err(|err| StepError::InvalidParams(format!("path '{raw}': {err}")))?;
        if path.is_dir() {
            return Err(StepError::permanent(format!(
                "{} is a directory; only files are supported",
                path.display()
            )));
        }
        Ok(path)
    }

    fn simulated(&self, path: &Path) -> Option<StepOutput> {
        self.ctx.dry_run.then(|| {
            debug!(path = %path.display(), "dry run: file left unchanged");
            StepOutput::simulated().field("path", path.display().to_string())
        })
    }

    fn read(&self, raw: &str) -> Result<StepOutput, StepError> {
        let path = self.target(raw)?;
        let content = fs::read_to_string(&path)
            .map_err(|err| StepError::execution(format!("read {}: {err}", path.display())))?;
        let mut out = StepOutput::success()
            .field("path", path.display().to_string())
            .field("content", content.clone());
        out.result.value = Some(content.into());
        Ok(out)
    }

    fn write(&self, raw: &str, content: &str, operation: &str) -> Result<StepOutput, StepError> {
        let path = self.target(raw)?;
        if let Some(out) = self.simulated(&path) {
            return Ok(out);
        }
        let bytes = content.as_bytes();
        self.put_file(&path, bytes, operation)?;
        Ok(StepOutput::success()
            .field("path", path.display().to_string())
            .field("bytes", bytes.len()))
    }

    fn append(&self, raw: &str, content: &str) -> Result<StepOutput, StepError> {
        let path = self.target(raw)?;
        if !path.exists() {
            return self.write(raw, content, "append");
        }
        if let Some(out) = self.simulated(&path) {
            return Ok(out);
        }
        let original = self.read_text(&path)?;
        let updated = format!("{original}{content}");
        self.edit(&path, &original, &updated, format!("append {} bytes", content.len()))?;
        Ok(StepOutput::success()
            .field("path", path.display().to_string())
            .field("bytes", updated.len()))
    }

    fn replace(
        &self,
        raw: &str,
        find: &str,
        replace: &str,
        count: Option<usize>,
    ) -> Result<StepOutput, StepError> {
        if find.is_empty() {
            return Err(StepError::InvalidParams("'find' must not be empty".to_string()));
        }
        let path = self.target(raw)?;
        if let Some(out) = self.simulated(&path) {
            return Ok(out);
        }
        let original = self.read_text(&path)?;
        let found = original.matches(find).count();
        let replaced = count.map_or(found, |limit| found.min(limit));
        if replaced > 0 {
            let updated = match count {
                Some(limit) => original.replacen(find, replace, limit),
                None => original.replace(find, replace),
            };
            self.edit(&path, &original, &updated, format!("replace {replaced} occurrence(s)"))?;
        }
        Ok(StepOutput::success()
            .field("path", path.display().to_string())
            .field("replacements", replaced))
    }

    fn delete(&self, raw: &str) -> Result<StepOutput, StepError> {
        let path = self.target(raw)?;
        if !path.exists() {
            return Err(StepError::permanent(format!("{} does not exist", path.display())));
        }
        if let Some(out) = self.simulated(&path) {
            return Ok(out);
        }
        self.remove_file(&path, "delete")?;
        Ok(StepOutput::success().field("path", path.display().to_string()))
    }

    fn copy(&self, from: &str, to: &str) -> Result<StepOutput, StepError> {
        let source = self.source(from)?;
        let dest = self.target(to)?;
        if let Some(out) = self.simulated(&dest) {
            return Ok(out);
        }
        let bytes = fs::read(&source)
            .map_err(|err| StepError::execution(format!("read {}: {err}", source.display())))?;
        self.put_file(&dest, &bytes, "copy")?;
        Ok(StepOutput::success()
            .field("path", dest.display().to_string())
            .field("from", source.display().to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<StepOutput, StepError> {
        let source = self.source(from)?;
        let dest = self.target(to)?;
        if source == dest {
            return Err(StepError::InvalidParams("move source and destination are the same path".to_string()));
        }
        if let Some(out) = self.simulated(&dest) {
            return Ok(out);
        }
        let bytes = fs::read(&source)
            .map_err(|err| StepError::execution(format!("read {}: {err}", source.display())))?;
        self.put_file(&dest, &bytes, "move")?;
        self.remove_file(&source, "move")?;
        Ok(StepOutput::success()
            .field("path", dest.display().to_string())
            .field("from", source.display().to_string()))
    }

    fn source(&self, raw: &str) -> Result<PathBuf, StepError> {
        let path = self.target(raw)?;
        if !path.is_file() {
            return Err(StepError::permanent(format!("{} does not exist", path.display())));
        }
        Ok(path)
    }

    fn read_text(&self, path: &Path) -> Result<String, StepError> {
        fs::read_to_string(path)
            .map_err(|err| StepError::execution(format!("read {}: {err}", path.display())))
    }

    /// Create or overwrite `path` with `bytes`, recording a Filesystem operation.
    fn put_file(&self, path: &Path, bytes: &[u8], operation: &str) -> Result<(), StepError> {
        let pre = self.snapshot(path)?;
        let created_dirs = missing_dirs(path);
        self.record(OperationAction::Filesystem {
            path: path.display().to_string(),
            operation: operation.to_string(),
            pre,
            post: PathState::File {
                hash: content_hash(bytes),
            },
            created_dirs: created_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StepError::execution(format!("create directory {}: {err}", parent.display()))
            })?;
        }
        write_bytes_atomic(path, bytes).map_err(|err| StepError::execution(format!("{err:#}")))
    }

    fn remove_file(&self, path: &Path, operation: &str) -> Result<(), StepError> {
        let pre = self.snapshot(path)?;
        self.record(OperationAction::Filesystem {
            path: path.display().to_string(),
            operation: operation.to_string(),
            pre,
            post: PathState::Absent,
            created_dirs: Vec::new(),
        })?;
        fs::remove_file(path)
            .map_err(|err| StepError::execution(format!("remove {}: {err}", path.display())))
    }

    /// Rewrite a text file, recording a Content operation with the full original text.
    fn edit(&self, path: &Path, original: &str, updated: &str, edit: String) -> Result<(), StepError> {
        let original_hash = match self.ctx.journal {
            Some(journal) => journal
                .backup(original.as_bytes())
                .map_err(|err| StepError::permanent(format!("backup {}: {err:#}", path.display())))?,
            None => content_hash(original.as_bytes()),
        };
        self.record(OperationAction::Content {
            path: path.display().to_string(),
            edit,
            original: original_hash,
            post: content_hash(updated.as_bytes()),
        })?;
        write_bytes_atomic(path, updated.as_bytes())
            .map_err(|err| StepError::execution(format!("{err:#}")))
    }

    /// Pre-state of `path`; existing bytes go to the backup store.
    fn snapshot(&self, path: &Path) -> Result<PathState, StepError> {
        if !path.exists() {
            return Ok(PathState::Absent);
        }
        let bytes = fs::read(path)
            .map_err(|err| StepError::execution(format!("read {}: {err}", path.display())))?;
        let hash = match self.ctx.journal {
            Some(journal) => journal
                .backup(&bytes)
                .map_err(|err| StepError::permanent(format!("backup {}: {err:#}", path.display())))?,
            None => content_hash(&bytes),
        };
        Ok(PathState::File { hash })
    }

    fn record(&self, action: OperationAction) -> Result<(), StepError> {
        if let Some(journal) = self.ctx.journal {
            journal
                .record(&self.ctx.step.id, action)
                .map_err(|err| StepError::permanent(format!("record operation: {err:#}")))?;
        }
        Ok(())
    }
}

/// Ancestors of `path` that do not exist yet, outermost first.
fn missing_dirs(path: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
        .map(Path::to_path_buf)
        .collect();
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oplog::{OperationFilter, OperationKind};
    use crate::plan::{PlanStep, StepAction};
    use crate::test_support::ExecFixture;
    use serde_json::json;

    fn file_step(params: FileParams) -> (PlanStep, FileParams) {
        (PlanStep::new("f", StepAction::File(params.clone())), params)
    }

    fn write(path: &str, content: &str) -> FileParams {
        FileParams::Write {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn kinds(fixture: &ExecFixture) -> Vec<OperationKind> {
        fixture
            .log()
            .list(&OperationFilter::default())
            .expect("list")
            .into_iter()
            .map(|entry| entry.record.action.kind())
            .collect()
    }

    #[test]
    fn write_records_pre_state_before_applying() {
        let fixture = ExecFixture::with_transaction();
        let (step, params) = file_step(write("nested/dir/out.txt", "hello"));

        let out = FileHandler.run(&params, &fixture.context(&step)).expect("write");
        let path = fixture.workdir().join("nested/dir/out.txt");
        assert_eq!(fs::read_to_string(&path).expect("read"), "hello");
        assert_eq!(out.fields["bytes"], json!(5));

        let entries = fixture.log().list(&OperationFilter::default()).expect("list");
        let OperationAction::Filesystem {
            pre, created_dirs, ..
        } = &entries[0].record.action
        else {
            panic!("expected filesystem record");
        };
        assert_eq!(pre, &PathState::Absent);
        assert_eq!(created_dirs.len(), 2);
        assert!(created_dirs[0].ends_with("nested"));
    }

    #[test]
    fn read_publishes_content() {
        let fixture = ExecFixture::new();
        fs::write(fixture.workdir().join("in.txt"), "data").expect("seed");
        let (step, params) = file_step(FileParams::Read {
            path: "in.txt".to_string(),
        });

        let out = FileHandler.run(&params, &fixture.context(&step)).expect("read");
        assert_eq!(out.fields["content"], json!("data"));
        assert_eq!(out.fields["operation"], json!("read"));
    }

    #[test]
    fn replace_and_append_produce_content_records() {
        let fixture = ExecFixture::with_transaction();
        fs::write(fixture.workdir().join("notes.txt"), "a-a-a").expect("seed");

        let (step, params) = file_step(FileParams::Replace {
            path: "notes.txt".to_string(),
            find: "a".to_string(),
            replace: "b".to_string(),
            count: Some(2),
        });
        let out = FileHandler.run(&params, &fixture.context(&step)).expect("replace");
        assert_eq!(out.fields["replacements"], json!(2));

        let (step, params) = file_step(FileParams::Append {
            path: "notes.txt".to_string(),
            content: "!".to_string(),
        });
        FileHandler.run(&params, &fixture.context(&step)).expect("append");

        assert_eq!(
            fs::read_to_string(fixture.workdir().join("notes.txt")).expect("read"),
            "b-b-a!"
        );
        assert_eq!(kinds(&fixture), vec![OperationKind::Content, OperationKind::Content]);
    }

    #[test]
    fn move_records_both_paths() {
        let fixture = ExecFixture::with_transaction();
        fs::write(fixture.workdir().join("a.txt"), "moved").expect("seed");
        let (step, params) = file_step(FileParams::Move {
            from: "a.txt".to_string(),
            to: "b.txt".to_string(),
        });

        FileHandler.run(&params, &fixture.context(&step)).expect("move");
        assert!(!fixture.workdir().join("a.txt").exists());
        assert_eq!(
            fs::read_to_string(fixture.workdir().join("b.txt")).expect("read"),
            "moved"
        );
        assert_eq!(
            kinds(&fixture),
            vec![OperationKind::Filesystem, OperationKind::Filesystem]
        );
    }

    #[test]
    fn delete_of_missing_file_is_not_retryable() {
        let fixture = ExecFixture::new();
        let (step, params) = file_step(FileParams::Delete {
            path: "ghost.txt".to_string(),
        });
        let failure = FileHandler
            .run(&params, &fixture.context(&step))
            .expect_err("missing");
        assert!(!failure.error.is_retryable());
    }

    #[test]
    fn dry_run_leaves_filesystem_untouched() {
        let mut fixture = ExecFixture::new();
        fixture.dry_run = true;
        let (step, params) = file_step(write("out.txt", "hello"));

        let out = FileHandler.run(&params, &fixture.context(&step)).expect("simulated");
        assert!(out.result.simulated);
        assert!(!fixture.workdir().join("out.txt").exists());
    }

    #[test]
    fn directories_are_rejected() {
        let fixture = ExecFixture::new();
        fs::create_dir(fixture.workdir().join("dir")).expect("mkdir");
        let (step, params) = file_step(FileParams::Delete {
            path: "dir".to_string(),
        });
        assert!(FileHandler.run(&params, &fixture.context(&step)).is_err());
    }
}
