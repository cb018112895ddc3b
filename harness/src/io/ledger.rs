//! Task ledger discovery and persistence.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::classifier::LEDGER_FILE_NAME;
use crate::io::config::write_atomic;

/// Ledger locations relative to the project root, in search order.
pub fn candidate_paths(root: &Path) -> [PathBuf; 3] {
    [
        root.join(LEDGER_FILE_NAME),
        root.join(".claude").join(LEDGER_FILE_NAME),
        root.join(".claude").join("plans.md"),
    ]
}

/// A ledger file and the contents observed when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Read the first candidate ledger that exists and is non-empty.
///
/// Returns `Ok(None)` when no candidate holds any content.
pub fn read_ledger(root: &Path) -> Result<Option<LedgerFile>> {
    for path in candidate_paths(root) {
        match fs::read_to_string(&path) {
            Ok(contents) if !contents.is_empty() => {
                debug!(path = %path.display(), "ledger located");
                return Ok(Some(LedgerFile { path, contents }));
            }
            Ok(_) => continue,
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                continue;
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
    Ok(None)
}

/// Persist new ledger contents atomically.
pub fn write_ledger(path: &Path, contents: &str) -> Result<()> {
    write_atomic(path, contents)
}
