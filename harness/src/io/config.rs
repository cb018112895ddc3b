//! Harness configuration stored under `.harness/config.toml`.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::core::policy::{PolicyConfig, PolicyError};
use crate::core::types::WorkflowMode;

/// Harness configuration (TOML).
///
/// Edited by humans and rewritten by the UI when policy changes. Missing
/// sections fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub policy: PolicyConfig,
    pub approval: ApprovalConfig,
    pub ledger: LedgerConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long a tool approval waits for a human before it is denied.
    pub tool_timeout_secs: u64,
    /// How long a clarifying question waits before the agent proceeds unanswered.
    pub question_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            question_timeout_secs: 120,
        }
    }
}

impl ApprovalConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.question_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub workflow_mode: WorkflowMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// External agent bridge command (e.g. `["my-agent", "--json"]`). Empty
    /// disables agent execution.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("approval.{field} must be > 0")]
    ZeroTimeout { field: &'static str },
    #[error("agent.command must not start with an empty program")]
    EmptyAgentProgram,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.approval.tool_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "tool_timeout_secs",
            });
        }
        if self.approval.question_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "question_timeout_secs",
            });
        }
        if self
            .agent
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(ConfigError::EmptyAgentProgram);
        }
        self.policy.validate()?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        return Ok(HarnessConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to `path` through a uniquely named sibling temp file
/// and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .with_context(|| format!("copy permissions of {}", path.display()))?;
    }
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyPreset, PolicyRule, UnknownToolPolicy};
    use crate::core::types::{OperationKind, PathCategory, PolicyBehavior};

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.policy.preset, PolicyPreset::Balanced);
        assert_eq!(cfg.approval.tool_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".harness/config.toml");
        let mut cfg = HarnessConfig::default();
        cfg.policy.preset = PolicyPreset::Strict;
        cfg.policy.rules
            .push(PolicyRule::new(PathCategory::Docs, OperationKind::ToolWrite, PolicyBehavior::Deny));
        cfg.ledger.workflow_mode = WorkflowMode::TwoAgent;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        let entries: Vec<_> = fs::read_dir(temp.path().join(".harness"))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("config.toml")]);
    }

    #[test]
    fn atomic_write_replaces_existing_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("Plans.md");
        fs::write(&path, "old\n").expect("seed");
        write_atomic(&path, "new\n").expect("write");
        write_atomic(&path, "newer\n").expect("write again");
        assert_eq!(fs::read_to_string(&path).expect("read"), "newer\n");
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 1);
    }

    #[test]
    fn parses_partial_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[policy]\npreset = \"fast\"\nunknown_tools = \"ask\"\n\n[ledger]\nworkflow_mode = \"2agent\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.policy.preset, PolicyPreset::Fast);
        assert_eq!(cfg.policy.unknown_tools, UnknownToolPolicy::Ask);
        assert_eq!(cfg.ledger.workflow_mode, WorkflowMode::TwoAgent);
        assert_eq!(cfg.approval, ApprovalConfig::default());
    }

    #[test]
    fn duplicate_rules_fail_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let rule = "[[policy.rules]]\ncategory = \"code\"\noperation = \"tool_edit\"\nbehavior = \"allow\"\n";
        fs::write(&path, format!("{rule}\n{rule}")).expect("write");
        let err = load_config(&path).expect_err("duplicate");
        assert!(format!("{err:#}").contains("duplicate custom rule"));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let mut cfg = HarnessConfig::default();
        cfg.approval.question_timeout_secs = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroTimeout {
                field: "question_timeout_secs"
            })
        );
    }
}
