//! Persistence for the recovery outcome table (`.stepwise/recovery.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::write_json;
use crate::core::recovery::OutcomeTable;

/// Load the table; a missing file yields an empty table.
pub fn load_outcomes(path: &Path) -> Result<OutcomeTable> {
    if !path.exists() {
        return Ok(OutcomeTable::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let table: OutcomeTable =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(path = %path.display(), signatures = table.entries.len(), "recovery outcomes loaded");
    Ok(table)
}

/// Atomically write the table (temp file + rename).
pub fn write_outcomes(path: &Path, table: &OutcomeTable) -> Result<()> {
    write_json(path, table)
}
