//! Git adapter for the delivery gate.
//!
//! The harness never mutates git state itself; it only inspects the worktree
//! so push/PR requests can be evaluated with accurate branch information.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::policy::is_primary_branch;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    fn is_staged(&self) -> bool {
        let index = self.code.as_bytes()[0];
        index != b' ' && index != b'?'
    }

    fn is_unstaged(&self) -> bool {
        self.code == "??" || self.code.as_bytes()[1] != b' '
    }
}

/// Branch and worktree facts gathered before a delivery operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preflight {
    pub branch: String,
    pub is_main_branch: bool,
    pub has_upstream: bool,
    pub ahead: u32,
    pub behind: u32,
    /// Pushing now would need a force push (local is behind its upstream).
    pub requires_force_push: bool,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub is_dirty: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Commits ahead of and behind the upstream, or `None` without one.
    pub fn ahead_behind(&self) -> Result<Option<(u32, u32)>> {
        let upstream = self.run(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])?;
        if !upstream.status.success() {
            debug!("no upstream configured");
            return Ok(None);
        }
        let out = self.run_capture(&["rev-list", "--left-right", "--count", "HEAD...@{u}"])?;
        parse_ahead_behind(&out).map(Some)
    }

    #[instrument(skip_all)]
    pub fn preflight(&self) -> Result<Preflight> {
        let branch = self.current_branch()?;
        let entries = self.status_porcelain()?;
        let counts = self.ahead_behind()?;
        let (ahead, behind) = counts.unwrap_or((0, 0));
        let staged: Vec<String> = entries
            .iter()
            .filter(|e| e.is_staged())
            .map(|e| e.path.clone())
            .collect();
        let unstaged: Vec<String> = entries
            .iter()
            .filter(|e| e.is_unstaged())
            .map(|e| e.path.clone())
            .collect();
        Ok(Preflight {
            is_main_branch: is_primary_branch(&branch),
            branch,
            has_upstream: counts.is_some(),
            ahead,
            behind,
            requires_force_push: behind > 0,
            is_dirty: !entries.is_empty(),
            staged,
            unstaged,
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_ahead_behind(out: &str) -> Result<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let mut next = |label: &str| -> Result<u32> {
        parts
            .next()
            .with_context(|| format!("rev-list output missing {label} count: '{out}'"))?
            .parse()
            .with_context(|| format!("parse {label} count"))
    };
    let ahead = next("ahead")?;
    let behind = next("behind")?;
    Ok((ahead, behind))
}
