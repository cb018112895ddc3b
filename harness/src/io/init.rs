//! Initialization helpers for `.harness/` scaffolding.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::info;

use super::config::{HarnessConfig, write_atomic, write_config};
use super::ledger::{candidate_paths, read_ledger};

/// Canonical harness paths for a project root.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    pub root: PathBuf,
    pub harness_dir: PathBuf,
    pub config_path: PathBuf,
}

impl HarnessPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let harness_dir = root.join(".harness");
        Self {
            config_path: harness_dir.join("config.toml"),
            harness_dir,
            root,
        }
    }
}

/// Options for `init_harness`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config with defaults.
    pub force: bool,
}

/// What `init_harness` created.
#[derive(Debug, Clone)]
pub struct InitReport {
    pub paths: HarnessPaths,
    /// Set when a starter ledger was written (no ledger existed).
    pub ledger_created: Option<PathBuf>,
}

/// Create `.harness/config.toml` and, if the project has no ledger yet, a
/// starter `Plans.md`.
///
/// Fails if the config already exists unless `options.force` is set. An
/// existing ledger is never touched.
pub fn init_harness(root: &Path, options: &InitOptions) -> Result<InitReport> {
    let paths = HarnessPaths::new(root);
    if paths.harness_dir.exists() && !paths.harness_dir.is_dir() {
        return Err(anyhow!("harness init: .harness exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "harness init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    write_config(&paths.config_path, &HarnessConfig::default())?;
    info!(path = %paths.config_path.display(), "wrote default config");

    let ledger_created = if read_ledger(root)?.is_none() {
        let [ledger_path, ..] = candidate_paths(root);
        write_atomic(&ledger_path, LEDGER_TEMPLATE)?;
        info!(path = %ledger_path.display(), "wrote starter ledger");
        Some(ledger_path)
    } else {
        None
    };

    Ok(InitReport {
        paths,
        ledger_created,
    })
}

pub const LEDGER_TEMPLATE: &str = "\
# Plans

## Plan
- [ ] Describe the first task here `cc:TODO`

## Work

## Review

## Done
";
