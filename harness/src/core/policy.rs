//! Layered policy evaluation for tool and git operations.
//!
//! Resolution order is fixed: locked rules, then custom rules, then the
//! preset table, then a fallback (`allow` for tool operations, `ask` for git
//! operations). Locked rules live outside [`PolicyConfig`], so no configuration
//! payload can shadow them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{OperationKind, PathCategory, PolicyBehavior};

pub const PROTECTED_PATH_REASON: &str =
    "changes to protected paths (Plans.md, .claude/memory/**) always require approval";
pub const FORCE_PUSH_REASON: &str = "force push is permanently forbidden";
pub const MAIN_BRANCH_PUSH_REASON: &str =
    "push to the main/master branch always requires explicit approval";

/// Branch names treated as the repository's primary branch.
pub const PRIMARY_BRANCHES: &[&str] = &["main", "master"];

/// Named bundle of default rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    Strict,
    #[default]
    Balanced,
    Fast,
}

/// How tool names missing from the classifier table are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownToolPolicy {
    /// Evaluate as `tool_read` (classifier fallback).
    #[default]
    Read,
    /// Always route through human approval.
    Ask,
}

/// A single (category, operation) rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub category: PathCategory,
    pub operation: OperationKind,
    pub behavior: PolicyBehavior,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<String>,
}

impl PolicyRule {
    pub fn new(category: PathCategory, operation: OperationKind, behavior: PolicyBehavior) -> Self {
        Self {
            category,
            operation,
            behavior,
            locked: false,
            locked_reason: None,
        }
    }

    fn matches(&self, category: PathCategory, operation: OperationKind) -> bool {
        self.category == category && self.operation == operation
    }
}

/// User-tunable policy configuration (`[policy]` in the config file).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub preset: PolicyPreset,
    pub unknown_tools: UnknownToolPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Sparse overrides, at most one per (category, operation).
    pub rules: Vec<PolicyRule>,
}

impl PolicyConfig {
    pub fn with_preset(preset: PolicyPreset) -> Self {
        Self {
            preset,
            ..Self::default()
        }
    }

    /// Reject rule tables with more than one rule per key.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert((rule.category, rule.operation)) {
                return Err(PolicyError::DuplicateRule {
                    category: rule.category,
                    operation: rule.operation,
                });
            }
        }
        Ok(())
    }
}

/// Partial configuration update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    pub preset: Option<PolicyPreset>,
    pub unknown_tools: Option<UnknownToolPolicy>,
    pub rules: Option<Vec<PolicyRule>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("duplicate custom rule for ({category}, {operation})")]
    DuplicateRule {
        category: PathCategory,
        operation: OperationKind,
    },
}

/// Which tier produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Locked,
    Custom,
    Preset,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub behavior: PolicyBehavior,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: RuleSource,
}

/// Input for [`PolicyEngine::evaluate_git`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRequest {
    pub operation: OperationKind,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_main_branch: bool,
    #[serde(default)]
    pub force: bool,
}

impl GitRequest {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            branch: None,
            is_main_branch: false,
            force: false,
        }
    }

    /// A push to `branch`; primary branch names set `is_main_branch`.
    pub fn push(branch: impl Into<String>, force: bool) -> Self {
        let branch = branch.into();
        Self {
            operation: OperationKind::GitPush,
            is_main_branch: is_primary_branch(&branch),
            branch: Some(branch),
            force,
        }
    }

    fn targets_main(&self) -> bool {
        self.is_main_branch || self.branch.as_deref().is_some_and(is_primary_branch)
    }
}

pub fn is_primary_branch(branch: &str) -> bool {
    PRIMARY_BRANCHES.contains(&branch)
}

/// Every rule currently in force, grouped by tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleListing {
    pub locked: Vec<PolicyRule>,
    pub preset: Vec<PolicyRule>,
    pub custom: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Copy)]
struct BuiltinRule {
    category: PathCategory,
    operation: OperationKind,
    behavior: PolicyBehavior,
    reason: Option<&'static str>,
}

impl BuiltinRule {
    fn to_rule(self, locked: bool) -> PolicyRule {
        PolicyRule {
            category: self.category,
            operation: self.operation,
            behavior: self.behavior,
            locked,
            locked_reason: self.reason.map(str::to_string),
        }
    }
}

const fn rule(
    category: PathCategory,
    operation: OperationKind,
    behavior: PolicyBehavior,
) -> BuiltinRule {
    BuiltinRule {
        category,
        operation,
        behavior,
        reason: None,
    }
}

const fn locked(
    category: PathCategory,
    operation: OperationKind,
    behavior: PolicyBehavior,
    reason: &'static str,
) -> BuiltinRule {
    BuiltinRule {
        category,
        operation,
        behavior,
        reason: Some(reason),
    }
}

use OperationKind::{GitCommit, GitPr, GitPush, ToolBash, ToolEdit, ToolWrite};
use PathCategory::{Code, Config, Docs, Other, Protected, Test};
use PolicyBehavior::{Allow, Ask, Deny};

const LOCKED_RULES: &[BuiltinRule] = &[
    locked(Protected, ToolWrite, Ask, PROTECTED_PATH_REASON),
    locked(Protected, ToolEdit, Ask, PROTECTED_PATH_REASON),
];

/// Push guards applied by `evaluate_git` before any path-keyed tier. They
/// depend on the request (force flag, target branch), so they are listed but
/// never matched by key.
const GIT_LOCKED_RULES: &[BuiltinRule] = &[
    locked(Other, GitPush, Deny, FORCE_PUSH_REASON),
    locked(Other, GitPush, Ask, MAIN_BRANCH_PUSH_REASON),
];

const STRICT_RULES: &[BuiltinRule] = &[
    rule(Code, ToolWrite, Ask),
    rule(Code, ToolEdit, Ask),
    rule(Config, ToolWrite, Ask),
    rule(Config, ToolEdit, Ask),
    rule(Test, ToolWrite, Ask),
    rule(Test, ToolEdit, Ask),
    rule(Other, ToolWrite, Ask),
    rule(Other, ToolEdit, Ask),
    rule(Other, ToolBash, Ask),
    rule(Other, GitCommit, Ask),
    rule(Other, GitPush, Ask),
    rule(Other, GitPr, Ask),
];

const BALANCED_RULES: &[BuiltinRule] = &[
    rule(Config, ToolWrite, Ask),
    rule(Config, ToolEdit, Ask),
    rule(Code, ToolWrite, Ask),
    rule(Code, ToolEdit, Ask),
    rule(Other, ToolBash, Ask),
    rule(Other, GitPush, Ask),
    rule(Other, GitPr, Ask),
    rule(Test, ToolWrite, Allow),
    rule(Test, ToolEdit, Allow),
    rule(Docs, ToolWrite, Allow),
    rule(Docs, ToolEdit, Allow),
];

const FAST_RULES: &[BuiltinRule] = &[
    rule(Code, ToolWrite, Allow),
    rule(Code, ToolEdit, Allow),
    rule(Test, ToolWrite, Allow),
    rule(Test, ToolEdit, Allow),
    rule(Docs, ToolWrite, Allow),
    rule(Docs, ToolEdit, Allow),
    rule(Config, ToolWrite, Ask),
    rule(Config, ToolEdit, Ask),
];

fn preset_rules(preset: PolicyPreset) -> &'static [BuiltinRule] {
    match preset {
        PolicyPreset::Strict => STRICT_RULES,
        PolicyPreset::Balanced => BALANCED_RULES,
        PolicyPreset::Fast => FAST_RULES,
    }
}

fn find_builtin(
    rules: &'static [BuiltinRule],
    category: PathCategory,
    operation: OperationKind,
) -> Option<&'static BuiltinRule> {
    rules
        .iter()
        .find(|r| r.category == category && r.operation == operation)
}

/// Evaluates operations against an owned [`PolicyConfig`].
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate a tool operation against the four-tier cascade.
    pub fn evaluate(&self, category: PathCategory, operation: OperationKind) -> PolicyDecision {
        if let Some(decision) = self.locked_tier(category, operation) {
            return decision;
        }
        self.configurable_tiers(category, operation)
            .unwrap_or(PolicyDecision {
                behavior: Allow,
                locked: false,
                reason: None,
                source: RuleSource::Fallback,
            })
    }

    /// Evaluate a git operation. Git operations are not path-based and are
    /// keyed under the `other` category.
    pub fn evaluate_git(&self, request: &GitRequest) -> PolicyDecision {
        let operation = request.operation;
        if operation == GitPush && request.force {
            return locked_decision(Deny, FORCE_PUSH_REASON);
        }
        if operation == GitPush && request.targets_main() {
            return locked_decision(Ask, MAIN_BRANCH_PUSH_REASON);
        }
        if let Some(decision) = self.locked_tier(Other, operation) {
            return decision;
        }
        self.configurable_tiers(Other, operation)
            .unwrap_or(PolicyDecision {
                behavior: Ask,
                locked: false,
                reason: None,
                source: RuleSource::Fallback,
            })
    }

    /// Apply a partial update. The candidate is validated before it replaces
    /// the active configuration, so a rejected update changes nothing.
    pub fn update(&mut self, update: PolicyUpdate, now: DateTime<Utc>) -> Result<(), PolicyError> {
        let mut next = self.config.clone();
        if let Some(preset) = update.preset {
            next.preset = preset;
        }
        if let Some(unknown_tools) = update.unknown_tools {
            next.unknown_tools = unknown_tools;
        }
        if let Some(rules) = update.rules {
            next.rules = rules;
        }
        next.validate()?;
        next.updated_at = Some(now);
        self.config = next;
        Ok(())
    }

    pub fn rules(&self) -> RuleListing {
        RuleListing {
            locked: LOCKED_RULES
                .iter()
                .chain(GIT_LOCKED_RULES)
                .map(|r| r.to_rule(true))
                .collect(),
            preset: preset_rules(self.config.preset)
                .iter()
                .map(|r| r.to_rule(false))
                .collect(),
            custom: self.config.rules.clone(),
        }
    }

    fn locked_tier(&self, category: PathCategory, operation: OperationKind) -> Option<PolicyDecision> {
        find_builtin(LOCKED_RULES, category, operation).map(|rule| PolicyDecision {
            behavior: rule.behavior,
            locked: true,
            reason: rule.reason.map(str::to_string),
            source: RuleSource::Locked,
        })
    }

    fn configurable_tiers(
        &self,
        category: PathCategory,
        operation: OperationKind,
    ) -> Option<PolicyDecision> {
        if let Some(custom) = self
            .config
            .rules
            .iter()
            .find(|r| r.matches(category, operation))
        {
            return Some(PolicyDecision {
                behavior: custom.behavior,
                locked: custom.locked,
                reason: custom.locked_reason.clone(),
                source: RuleSource::Custom,
            });
        }
        find_builtin(preset_rules(self.config.preset), category, operation).map(|rule| {
            PolicyDecision {
                behavior: rule.behavior,
                locked: false,
                reason: None,
                source: RuleSource::Preset,
            }
        })
    }
}

fn locked_decision(behavior: PolicyBehavior, reason: &str) -> PolicyDecision {
    PolicyDecision {
        behavior,
        locked: true,
        reason: Some(reason.to_string()),
        source: RuleSource::Locked,
    }
}
