//! Deterministic classification of paths and tool names.
//!
//! Both functions are pure: the same input always yields the same category or
//! kind. Checks run in a fixed order so that a path matching several patterns
//! lands in the most sensitive applicable category.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{OperationKind, PathCategory};

/// File name of the shared task ledger.
pub const LEDGER_FILE_NAME: &str = "Plans.md";

static TEST_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(test|spec)\.(ts|tsx|js|jsx)$").unwrap());

const TEST_DIRS: &[&str] = &["test", "tests", "__tests__"];
const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml", "ini", "env", "config"];
const CONFIG_DIRS: &[&str] = &["config"];
const DOC_EXTENSIONS: &[&str] = &["md", "rst", "adoc"];
const DOC_DIRS: &[&str] = &["docs", "documentation"];
const CODE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "py", "rb", "go", "rs", "java", "kt", "swift", "cpp", "c", "h",
];
const CODE_DIRS: &[&str] = &["src", "lib", "components"];

const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LSP"];
const SHELL_TOOLS: &[&str] = &["Bash", "Shell"];

/// Classify a target path into a [`PathCategory`].
///
/// Order: protected, test, config, docs, code, other. `None` (e.g. a shell
/// command with no single target file) is `Other`.
pub fn classify_path(path: Option<&str>) -> PathCategory {
    let Some(raw) = path.filter(|p| !p.trim().is_empty()) else {
        return PathCategory::Other;
    };
    let normalized = raw.replace('\\', "/");
    let path = Path::new(&normalized);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let dirs = dir_segments(path);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let has_extension = |set: &[&str]| extension.as_deref().is_some_and(|ext| set.contains(&ext));
    let in_dir = |set: &[&str]| dirs.iter().any(|d| set.contains(d));

    if is_protected(file_name, &dirs) {
        return PathCategory::Protected;
    }
    if TEST_FILE_RE.is_match(file_name) || in_dir(TEST_DIRS) {
        return PathCategory::Test;
    }
    if has_extension(CONFIG_EXTENSIONS) || in_dir(CONFIG_DIRS) || file_name.starts_with(".env") {
        return PathCategory::Config;
    }
    if has_extension(DOC_EXTENSIONS) || in_dir(DOC_DIRS) {
        return PathCategory::Docs;
    }
    if has_extension(CODE_EXTENSIONS) || in_dir(CODE_DIRS) {
        return PathCategory::Code;
    }
    PathCategory::Other
}

/// Classify a tool or pseudo-tool name into an [`OperationKind`].
///
/// Unrecognised names fall back to `ToolRead`; use [`is_known_tool`] to detect
/// the fallback.
pub fn classify_operation(tool_name: &str) -> OperationKind {
    known_operation(tool_name).unwrap_or(OperationKind::ToolRead)
}

/// True if `tool_name` has an explicit entry in the lookup table.
pub fn is_known_tool(tool_name: &str) -> bool {
    known_operation(tool_name).is_some()
}

fn known_operation(tool_name: &str) -> Option<OperationKind> {
    if READ_TOOLS.contains(&tool_name) {
        return Some(OperationKind::ToolRead);
    }
    if SHELL_TOOLS.contains(&tool_name) {
        return Some(OperationKind::ToolBash);
    }
    match tool_name {
        "Write" => Some(OperationKind::ToolWrite),
        "Edit" => Some(OperationKind::ToolEdit),
        "git_commit" => Some(OperationKind::GitCommit),
        "git_push" => Some(OperationKind::GitPush),
        "git_pr" => Some(OperationKind::GitPr),
        "git_release" => Some(OperationKind::GitRelease),
        _ => None,
    }
}

fn is_protected(file_name: &str, dirs: &[&str]) -> bool {
    if file_name.eq_ignore_ascii_case(LEDGER_FILE_NAME) {
        return true;
    }
    dirs.windows(2)
        .any(|pair| pair[0] == ".claude" && pair[1] == "memory")
}

/// Directory components of `path`, excluding the final file name.
fn dir_segments(path: &Path) -> Vec<&str> {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect()
}
