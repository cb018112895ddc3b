//! Ledger reads and guarded marker updates.
//!
//! An update passes three guards in order: transition legality (two-agent
//! mode only), the optimistic line check against a fresh read, and the
//! presence of the old marker on that line. Each failure has its own
//! [`TaskUpdateError`] variant and status code.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::marker_update::{MarkerEditError, apply_marker_edit};
use crate::core::plans::{Board, HandoffStatus, handoff_status, parse_ledger};
use crate::core::transitions::{TransitionViolation, validate_transition};
use crate::core::types::{ActorRole, WorkflowMode};
use crate::io::ledger::{read_ledger, write_ledger};

pub const LEDGER_NOT_FOUND: &str =
    "ledger not found (looked for Plans.md, .claude/Plans.md, .claude/plans.md)";
pub const CONFLICT_SUGGESTION: &str = "reload the ledger and review its latest state before retrying";

/// Serializes read-check-write cycles on the ledger within this process.
static LEDGER_WRITE: Mutex<()> = Mutex::new(());

/// Parsed ledger plus the context it was read in.
#[derive(Debug, Clone, Serialize)]
pub struct BoardResponse {
    #[serde(flatten)]
    pub board: Board,
    pub mode: WorkflowMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffStatus>,
}

/// Read and parse the project's ledger.
#[instrument(skip_all, fields(root = %root.display(), %mode))]
pub fn load_board(root: &Path, mode: WorkflowMode) -> anyhow::Result<BoardResponse> {
    let Some(ledger) = read_ledger(root)? else {
        return Ok(BoardResponse {
            board: Board {
                error: Some(LEDGER_NOT_FOUND.to_string()),
                ..Board::default()
            },
            mode,
            ledger_path: None,
            handoff: None,
        });
    };
    let display_path = relative_display(root, &ledger.path);
    let board = parse_ledger(&ledger.contents, mode, Some(&display_path));
    let handoff = (mode == WorkflowMode::TwoAgent).then(|| handoff_status(&board));
    Ok(BoardResponse {
        board,
        mode,
        ledger_path: Some(display_path),
        handoff,
    })
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Marker transition request. Fields are optional so missing ones surface
/// as a validation error rather than a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskUpdateRequest {
    pub line_number: Option<usize>,
    pub expected_line: Option<String>,
    pub old_marker: Option<String>,
    pub new_marker: Option<String>,
    pub workflow_mode: Option<WorkflowMode>,
    pub actor_role: Option<ActorRole>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpdateSuccess {
    pub success: bool,
    pub line_number: usize,
    pub old_line: String,
    pub new_line: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TaskUpdateError {
    #[error("missing required fields: {}", fields.join(", "))]
    MissingFields { fields: Vec<&'static str> },
    #[error("actor_role (pm|impl) is required in 2agent mode")]
    MissingActor,
    #[error("{message}")]
    InvalidTransition {
        message: String,
        old_marker: String,
        new_marker: String,
        actor_role: ActorRole,
        workflow_mode: WorkflowMode,
        allowed: Vec<String>,
    },
    #[error("{message}")]
    ActorNotPermitted {
        message: String,
        old_marker: String,
        new_marker: String,
        actor_role: ActorRole,
        workflow_mode: WorkflowMode,
        allowed_actors: Vec<ActorRole>,
    },
    #[error("{LEDGER_NOT_FOUND}")]
    LedgerNotFound,
    #[error("line {line_number} is out of range (ledger has {line_count} lines)")]
    LineOutOfRange { line_number: usize, line_count: usize },
    #[error("conflict detected: the ledger line changed since it was read")]
    Conflict {
        expected_line: String,
        current_line: String,
    },
    #[error("marker `{marker}` not found on line")]
    MarkerNotFound { marker: String, current_line: String },
    #[error("ledger update failed: {0:#}")]
    Io(#[from] anyhow::Error),
}

impl TaskUpdateError {
    /// HTTP-style status for the error shape.
    pub fn status_code(&self) -> u16 {
        match self {
            TaskUpdateError::MissingFields { .. }
            | TaskUpdateError::MissingActor
            | TaskUpdateError::LineOutOfRange { .. }
            | TaskUpdateError::MarkerNotFound { .. } => 400,
            TaskUpdateError::ActorNotPermitted { .. } => 403,
            TaskUpdateError::LedgerNotFound => 404,
            TaskUpdateError::Conflict { .. } => 409,
            TaskUpdateError::InvalidTransition { .. } => 422,
            TaskUpdateError::Io(_) => 500,
        }
    }

    /// Structured payload; every shape carries `error`.
    pub fn to_body(&self) -> Value {
        let error = self.to_string();
        match self {
            TaskUpdateError::MissingFields { fields } => json!({
                "error": error,
                "missing_fields": fields,
            }),
            TaskUpdateError::MissingActor => json!({
                "error": error,
                "missing_field": "actor_role",
                "workflow_mode": WorkflowMode::TwoAgent,
            }),
            TaskUpdateError::InvalidTransition {
                old_marker,
                new_marker,
                actor_role,
                workflow_mode,
                allowed,
                ..
            } => json!({
                "error": error,
                "invalid_transition": true,
                "old_marker": old_marker,
                "new_marker": new_marker,
                "actor_role": actor_role,
                "workflow_mode": workflow_mode,
                "allowed": allowed,
            }),
            TaskUpdateError::ActorNotPermitted {
                old_marker,
                new_marker,
                actor_role,
                workflow_mode,
                allowed_actors,
                ..
            } => json!({
                "error": error,
                "actor_not_permitted": true,
                "old_marker": old_marker,
                "new_marker": new_marker,
                "actor_role": actor_role,
                "workflow_mode": workflow_mode,
                "allowed_actors": allowed_actors,
            }),
            TaskUpdateError::Conflict {
                expected_line,
                current_line,
            } => json!({
                "error": error,
                "conflict": true,
                "expected_line": expected_line,
                "current_line": current_line,
                "suggestion": CONFLICT_SUGGESTION,
            }),
            TaskUpdateError::MarkerNotFound { current_line, .. } => json!({
                "error": error,
                "current_line": current_line,
            }),
            TaskUpdateError::LedgerNotFound
            | TaskUpdateError::LineOutOfRange { .. }
            | TaskUpdateError::Io(_) => json!({ "error": error }),
        }
    }
}

/// Apply a marker transition to the ledger under `root`.
///
/// `default_mode` applies when the request does not name a mode. Conflicts
/// are never retried: the caller must re-read and decide again.
#[instrument(skip_all, fields(root = %root.display(), line = request.line_number))]
pub fn update_task(
    root: &Path,
    request: &TaskUpdateRequest,
    default_mode: WorkflowMode,
) -> Result<TaskUpdateSuccess, TaskUpdateError> {
    let (line_number, expected_line, old_marker, new_marker) = required_fields(request)?;
    let mode = request.workflow_mode.unwrap_or(default_mode);

    if mode == WorkflowMode::TwoAgent {
        let actor = request.actor_role.ok_or(TaskUpdateError::MissingActor)?;
        if old_marker != new_marker {
            check_transition(old_marker, new_marker, mode, actor)?;
        }
    }

    let _write = LEDGER_WRITE.lock().unwrap_or_else(PoisonError::into_inner);
    let ledger = read_ledger(root)?.ok_or(TaskUpdateError::LedgerNotFound)?;
    let edit = apply_marker_edit(
        &ledger.contents,
        line_number,
        expected_line,
        old_marker,
        new_marker,
    )
    .map_err(|err| match err {
        MarkerEditError::LineOutOfRange {
            line_number,
            line_count,
        } => TaskUpdateError::LineOutOfRange {
            line_number,
            line_count,
        },
        MarkerEditError::Conflict {
            expected_line,
            current_line,
        } => {
            warn!("optimistic lock conflict");
            TaskUpdateError::Conflict {
                expected_line,
                current_line,
            }
        }
        MarkerEditError::MarkerNotFound {
            marker,
            current_line,
        } => TaskUpdateError::MarkerNotFound {
            marker,
            current_line,
        },
    })?;

    if edit.content == ledger.contents {
        debug!(old_marker, "marker unchanged; nothing to write");
        return Ok(TaskUpdateSuccess {
            success: true,
            line_number,
            old_line: edit.old_line,
            new_line: edit.new_line,
            message: format!("marker already {new_marker}"),
        });
    }

    write_ledger(&ledger.path, &edit.content)?;
    info!(old_marker, new_marker, %mode, "ledger marker updated");
    Ok(TaskUpdateSuccess {
        success: true,
        line_number,
        old_line: edit.old_line,
        new_line: edit.new_line,
        message: format!("marker updated from {old_marker} to {new_marker}"),
    })
}

fn check_transition(
    old_marker: &str,
    new_marker: &str,
    mode: WorkflowMode,
    actor: ActorRole,
) -> Result<(), TaskUpdateError> {
    validate_transition(old_marker, new_marker, mode, actor).map_err(|violation| {
        let message = violation.describe(old_marker, new_marker);
        warn!(old_marker, new_marker, %actor, "transition rejected");
        match violation {
            TransitionViolation::InvalidTarget { allowed } => TaskUpdateError::InvalidTransition {
                message,
                old_marker: old_marker.to_string(),
                new_marker: new_marker.to_string(),
                actor_role: actor,
                workflow_mode: mode,
                allowed,
            },
            TransitionViolation::ActorNotPermitted { allowed_actors, .. } => {
                TaskUpdateError::ActorNotPermitted {
                    message,
                    old_marker: old_marker.to_string(),
                    new_marker: new_marker.to_string(),
                    actor_role: actor,
                    workflow_mode: mode,
                    allowed_actors,
                }
            }
        }
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn required_fields(
    request: &TaskUpdateRequest,
) -> Result<(usize, &str, &str, &str), TaskUpdateError> {
    let line_number = request.line_number.filter(|n| *n > 0);
    let expected_line = non_empty(&request.expected_line);
    let old_marker = non_empty(&request.old_marker);
    let new_marker = non_empty(&request.new_marker);

    match (line_number, expected_line, old_marker, new_marker) {
        (Some(line), Some(expected), Some(old), Some(new)) => Ok((line, expected, old, new)),
        _ => {
            let mut fields = Vec::new();
            if line_number.is_none() {
                fields.push("line_number");
            }
            if expected_line.is_none() {
                fields.push("expected_line");
            }
            if old_marker.is_none() {
                fields.push("old_marker");
            }
            if new_marker.is_none() {
                fields.push("new_marker");
            }
            Err(TaskUpdateError::MissingFields { fields })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const LEDGER: &str = "## Plan\n- [ ] Login form `pm:依頼中`\n- [ ] Search `cc:WIP`\n";

    fn request(line: usize, expected: &str, old: &str, new: &str) -> TaskUpdateRequest {
        TaskUpdateRequest {
            line_number: Some(line),
            expected_line: Some(expected.to_string()),
            old_marker: Some(old.to_string()),
            new_marker: Some(new.to_string()),
            workflow_mode: None,
            actor_role: None,
        }
    }

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("Plans.md"), LEDGER).expect("write ledger");
        temp
    }

    #[test]
    fn solo_update_rewrites_line() {
        let temp = project();
        let ok = update_task(
            temp.path(),
            &request(3, "- [ ] Search `cc:WIP`", "cc:WIP", "cc:完了"),
            WorkflowMode::Solo,
        )
        .expect("update");
        assert!(ok.success);
        assert_eq!(ok.new_line, "- [ ] Search `cc:完了`");
        let contents = fs::read_to_string(temp.path().join("Plans.md")).expect("read");
        assert_eq!(
            contents,
            "## Plan\n- [ ] Login form `pm:依頼中`\n- [ ] Search `cc:完了`\n"
        );
    }

    #[test]
    fn missing_fields_are_listed() {
        let temp = project();
        let err = update_task(
            temp.path(),
            &TaskUpdateRequest {
                line_number: Some(2),
                old_marker: Some(String::new()),
                ..TaskUpdateRequest::default()
            },
            WorkflowMode::Solo,
        )
        .expect_err("invalid");
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err.to_body()["missing_fields"],
            json!(["expected_line", "old_marker", "new_marker"])
        );
    }

    #[test]
    fn two_agent_requires_actor() {
        let temp = project();
        let mut req = request(2, "- [ ] Login form `pm:依頼中`", "pm:依頼中", "cc:WIP");
        req.workflow_mode = Some(WorkflowMode::TwoAgent);
        let err = update_task(temp.path(), &req, WorkflowMode::Solo).expect_err("actor");
        assert!(matches!(err, TaskUpdateError::MissingActor));
        assert_eq!(err.to_body()["missing_field"], "actor_role");
    }

    /// Picking up a PM request is the implementer's move, not the PM's.
    #[test]
    fn wrong_actor_is_rejected_then_right_actor_succeeds() {
        let temp = project();
        let mut req = request(2, "- [ ] Login form `pm:依頼中`", "pm:依頼中", "cc:WIP");
        req.actor_role = Some(ActorRole::Pm);

        let err = update_task(temp.path(), &req, WorkflowMode::TwoAgent).expect_err("pm");
        assert_eq!(err.status_code(), 403);
        let body = err.to_body();
        assert_eq!(body["actor_not_permitted"], true);
        assert_eq!(body["allowed_actors"], json!(["impl"]));
        assert_eq!(
            fs::read_to_string(temp.path().join("Plans.md")).expect("read"),
            LEDGER
        );

        req.actor_role = Some(ActorRole::Impl);
        let ok = update_task(temp.path(), &req, WorkflowMode::TwoAgent).expect("impl");
        assert_eq!(ok.new_line, "- [ ] Login form `cc:WIP`");
    }

    #[test]
    fn invalid_target_is_422_with_allowed() {
        let temp = project();
        let mut req = request(3, "- [ ] Search `cc:WIP`", "cc:WIP", "pm:確認済");
        req.workflow_mode = Some(WorkflowMode::TwoAgent);
        req.actor_role = Some(ActorRole::Impl);
        let err = update_task(temp.path(), &req, WorkflowMode::Solo).expect_err("invalid");
        assert_eq!(err.status_code(), 422);
        let body = err.to_body();
        assert_eq!(body["invalid_transition"], true);
        assert_eq!(body["workflow_mode"], "2agent");
        assert_eq!(body["actor_role"], "impl");
        assert_eq!(body["allowed"], json!(["cc:完了", "cc:blocked"]));
    }

    #[test]
    fn stale_line_conflicts_and_leaves_file() {
        let temp = project();
        let path = temp.path().join("Plans.md");
        let edited = LEDGER.replace("Search `cc:WIP`", "Search v2 `cc:WIP`");
        fs::write(&path, &edited).expect("external edit");

        let err = update_task(
            temp.path(),
            &request(3, "- [ ] Search `cc:WIP`", "cc:WIP", "cc:完了"),
            WorkflowMode::Solo,
        )
        .expect_err("conflict");
        assert_eq!(err.status_code(), 409);
        let body = err.to_body();
        assert_eq!(body["conflict"], true);
        assert_eq!(body["expected_line"], "- [ ] Search `cc:WIP`");
        assert_eq!(body["current_line"], "- [ ] Search v2 `cc:WIP`");
        assert_eq!(body["suggestion"], CONFLICT_SUGGESTION);
        assert_eq!(fs::read_to_string(&path).expect("read"), edited);
    }

    #[test]
    fn missing_ledger_is_404() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = update_task(
            temp.path(),
            &request(1, "x", "cc:TODO", "cc:WIP"),
            WorkflowMode::Solo,
        )
        .expect_err("missing");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn out_of_range_and_missing_marker_are_400() {
        let temp = project();
        let err = update_task(
            temp.path(),
            &request(40, "x", "cc:TODO", "cc:WIP"),
            WorkflowMode::Solo,
        )
        .expect_err("range");
        assert!(matches!(err, TaskUpdateError::LineOutOfRange { .. }));
        assert_eq!(err.status_code(), 400);

        let err = update_task(
            temp.path(),
            &request(3, "- [ ] Search `cc:WIP`", "cc:TODO", "cc:WIP"),
            WorkflowMode::Solo,
        )
        .expect_err("marker");
        assert!(matches!(err, TaskUpdateError::MarkerNotFound { .. }));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn load_board_reports_handoff_in_two_agent_mode() {
        let temp = project();
        let response = load_board(temp.path(), WorkflowMode::TwoAgent).expect("load");
        assert_eq!(response.ledger_path.as_deref(), Some("Plans.md"));
        let handoff = response.handoff.expect("handoff");
        assert_eq!(handoff.impl_waiting, 1);
        assert_eq!(handoff.in_progress, 1);

        let task = &response.board.plan[0];
        assert_eq!(
            task.source.as_ref().and_then(|s| s.file_path.as_deref()),
            Some("Plans.md")
        );

        let solo = load_board(temp.path(), WorkflowMode::Solo).expect("load");
        assert!(solo.handoff.is_none());
    }

    #[test]
    fn load_board_without_ledger_sets_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let response = load_board(temp.path(), WorkflowMode::Solo).expect("load");
        assert_eq!(response.board.error.as_deref(), Some(LEDGER_NOT_FOUND));
        let json = serde_json::to_value(&response).expect("json");
        assert_eq!(json["mode"], "solo");
        assert_eq!(json["plan"], json!([]));
    }

    /// Same-line writers racing from one stale read: exactly one wins and the
    /// rest see a conflict naming the winner's line.
    #[test]
    fn concurrent_updates_on_one_line_admit_a_single_writer() {
        use std::sync::{Arc, Barrier};

        let targets = ["cc:完了", "cc:blocked", "cc:TODO", "cc:DONE", "cc:作業中", "cc:WORK"];
        for _ in 0..25 {
            let temp = project();
            let root = Arc::new(temp.path().to_path_buf());
            let barrier = Arc::new(Barrier::new(targets.len()));
            let handles: Vec<_> = targets
                .iter()
                .map(|target| {
                    let root = Arc::clone(&root);
                    let barrier = Arc::clone(&barrier);
                    let req = request(3, "- [ ] Search `cc:WIP`", "cc:WIP", target);
                    std::thread::spawn(move || {
                        barrier.wait();
                        update_task(&root, &req, WorkflowMode::Solo)
                    })
                })
                .collect();
            let results: Vec<_> = handles
                .into_iter()
                .map(|h| h.join().expect("join"))
                .collect();

            let winners: Vec<&TaskUpdateSuccess> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1);
            let winner_line = winners[0].new_line.clone();
            for result in &results {
                if let Err(err) = result {
                    match err {
                        TaskUpdateError::Conflict { current_line, .. } => {
                            assert_eq!(current_line, &winner_line);
                        }
                        other => panic!("expected conflict, got {other:?}"),
                    }
                }
            }
            let contents = fs::read_to_string(temp.path().join("Plans.md")).expect("read");
            assert_eq!(
                contents,
                format!("## Plan\n- [ ] Login form `pm:依頼中`\n{winner_line}\n")
            );
        }
    }

    /// Re-submitting the current marker succeeds without touching the file,
    /// even in two-agent mode where the graph has no self edges.
    #[test]
    fn unchanged_marker_is_a_no_op() {
        let temp = project();
        let path = temp.path().join("Plans.md");
        let mut req = request(3, "- [ ] Search `cc:WIP`", "cc:WIP", "cc:WIP");
        req.actor_role = Some(ActorRole::Impl);

        let ok = update_task(temp.path(), &req, WorkflowMode::TwoAgent).expect("no-op");
        assert_eq!(ok.old_line, ok.new_line);
        assert_eq!(fs::read_to_string(&path).expect("read"), LEDGER);

        let stale = request(3, "- [ ] Search v0 `cc:WIP`", "cc:WIP", "cc:WIP");
        let err = update_task(temp.path(), &stale, WorkflowMode::Solo).expect_err("stale");
        assert_eq!(err.status_code(), 409);
    }
}
