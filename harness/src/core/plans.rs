//! Task ledger parsing.
//!
//! The ledger is a markdown checklist. Parsing runs two passes: every line
//! carrying a backtick-quoted marker is classified by the marker, then
//! unmarked checklist lines take the status of the nearest recognised section
//! heading. Marker classification always wins over section placement.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{Priority, Task, TaskSource, TaskStatus, WorkflowMode};

pub const EMPTY_LEDGER_ERROR: &str = "ledger is empty";
pub const NO_TASKS_ERROR: &str = "no tasks found in the ledger; write tasks as checklist items \
     (`- [ ] task name`) and add a marker such as `cc:TODO` to make their state explicit";

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-\s*\[([ xX])\]\s*(.+)$").unwrap());
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`((?:cc|pm|cursor):[^`\s]+)`").unwrap());

static SECTION_PATTERNS: LazyLock<[(TaskStatus, Regex); 4]> = LazyLock::new(|| {
    [
        (
            TaskStatus::Plan,
            Regex::new(r"^##\s*(?:(?i:plan|todo)|計画|未着手|🟡\s*未着手|次に着手)").unwrap(),
        ),
        (
            TaskStatus::Work,
            Regex::new(r"^##\s*(?:(?i:work|in\s*progress)|作業中|進行中|🔴\s*進行中)").unwrap(),
        ),
        (
            TaskStatus::Review,
            Regex::new(r"^##\s*(?:(?i:review)|レビュー|確認待ち)").unwrap(),
        ),
        (
            TaskStatus::Done,
            Regex::new(r"^##\s*(?:(?i:done|completed)|完了|直近完了|🟢\s*完了)").unwrap(),
        ),
    ]
});

const PRIORITY_EMOJI: [(&str, Priority); 3] = [
    ("🔴", Priority::High),
    ("🟡", Priority::Medium),
    ("🟢", Priority::Low),
];

/// A single checklist line, before status assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub title: String,
    pub completed: bool,
    pub priority: Option<Priority>,
    pub marker: Option<String>,
}

/// Parse one line; `None` unless it is a `- [ ]` / `- [x]` checklist item.
pub fn parse_task_line(line: &str) -> Option<ParsedLine> {
    let caps = CHECKBOX_RE.captures(line)?;
    let completed = caps[1].eq_ignore_ascii_case("x");
    let mut title = caps[2].trim().to_string();

    let mut priority = None;
    for (emoji, level) in PRIORITY_EMOJI {
        if title.contains(emoji) {
            priority = Some(level);
            title = title.replacen(emoji, "", 1).trim().to_string();
            break;
        }
    }

    let marker = MARKER_RE
        .captures(&title)
        .map(|caps| caps[1].to_string());
    if marker.is_some() {
        title = MARKER_RE.replace_all(&title, "").trim().to_string();
    }

    Some(ParsedLine {
        title,
        completed,
        priority,
        marker,
    })
}

/// Map a marker to its column. `cc:完了` is done in solo mode and waits in
/// review in two-agent mode; legacy `cursor:完了` is always done.
pub fn marker_status(marker: &str, mode: WorkflowMode, completed: bool) -> TaskStatus {
    let has_any = |needles: &[&str]| needles.iter().any(|n| marker.contains(n));
    if has_any(&["TODO", "依頼中"]) {
        TaskStatus::Plan
    } else if has_any(&["WIP", "作業中", "WORK", "IN_PROGRESS"]) {
        TaskStatus::Work
    } else if has_any(&["完了", "DONE"]) {
        if marker.starts_with("cursor:") || mode == WorkflowMode::Solo {
            TaskStatus::Done
        } else {
            TaskStatus::Review
        }
    } else if has_any(&["確認済", "承認"]) {
        TaskStatus::Done
    } else if completed {
        TaskStatus::Done
    } else {
        TaskStatus::Plan
    }
}

fn section_status(line: &str) -> Option<TaskStatus> {
    SECTION_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(line))
        .map(|(status, _)| *status)
}

/// Ledger contents grouped into kanban columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Board {
    pub plan: Vec<Task>,
    pub work: Vec<Task>,
    pub review: Vec<Task>,
    pub done: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Board {
    pub fn column(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Plan => &self.plan,
            TaskStatus::Work => &self.work,
            TaskStatus::Review => &self.review,
            TaskStatus::Done => &self.done,
        }
    }

    fn column_mut(&mut self, status: TaskStatus) -> &mut Vec<Task> {
        match status {
            TaskStatus::Plan => &mut self.plan,
            TaskStatus::Work => &mut self.work,
            TaskStatus::Review => &mut self.review,
            TaskStatus::Done => &mut self.done,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.column(*s).len()).sum()
    }

    fn push(&mut self, status: TaskStatus, parsed: ParsedLine, source: TaskSource) {
        self.column_mut(status).push(Task {
            id: format!("task-{}", source.line_number),
            title: parsed.title,
            status,
            priority: parsed.priority,
            source: Some(source),
        });
    }
}

/// Parse ledger markdown into a [`Board`].
///
/// Failures are reported in `Board::error` rather than as `Err`, since an
/// empty or unstructured ledger is a normal state for a new project.
pub fn parse_ledger(markdown: &str, mode: WorkflowMode, file_path: Option<&str>) -> Board {
    let mut board = Board::default();
    if markdown.trim().is_empty() {
        board.error = Some(EMPTY_LEDGER_ERROR.to_string());
        return board;
    }

    let lines: Vec<&str> = markdown.split('\n').collect();
    let source_for = |index: usize, line: &str, marker: Option<String>| TaskSource {
        line_number: index + 1,
        original_line: line.to_string(),
        marker,
        file_path: file_path.map(str::to_string),
    };

    let mut seen_titles = HashSet::new();
    for (index, line) in lines.iter().enumerate() {
        let Some(parsed) = parse_task_line(line) else {
            continue;
        };
        let Some(marker) = parsed.marker.clone() else {
            continue;
        };
        let status = marker_status(&marker, mode, parsed.completed);
        seen_titles.insert(normalize_title(&parsed.title));
        board.push(status, parsed, source_for(index, line, Some(marker)));
    }

    let mut section = None;
    for (index, line) in lines.iter().enumerate() {
        if let Some(status) = section_status(line) {
            section = Some(status);
            continue;
        }
        let Some(status) = section else {
            continue;
        };
        let Some(parsed) = parse_task_line(line) else {
            continue;
        };
        if parsed.marker.is_some() {
            continue;
        }
        if !seen_titles.insert(normalize_title(&parsed.title)) {
            continue;
        }
        board.push(status, parsed, source_for(index, line, None));
    }

    if board.total() == 0 {
        board.error = Some(NO_TASKS_ERROR.to_string());
    }
    board
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Overall two-agent handoff state, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    PmWaiting,
    ImplWaiting,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandoffStatus {
    pub state: HandoffState,
    /// Plan tasks explicitly requested by the PM (`依頼中`).
    pub impl_waiting: usize,
    /// Tasks in review awaiting PM sign-off.
    pub pm_waiting: usize,
    pub in_progress: usize,
}

pub fn handoff_status(board: &Board) -> HandoffStatus {
    let impl_waiting = board
        .plan
        .iter()
        .filter(|task| {
            task.source
                .as_ref()
                .and_then(|s| s.marker.as_deref())
                .is_some_and(|m| m.contains("依頼中"))
        })
        .count();
    let pm_waiting = board.review.len();
    let state = if pm_waiting > 0 {
        HandoffState::PmWaiting
    } else if impl_waiting > 0 {
        HandoffState::ImplWaiting
    } else {
        HandoffState::Idle
    };
    HandoffStatus {
        state,
        impl_waiting,
        pm_waiting,
        in_progress: board.work.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEDGER: &str = "\
# Project plan

## Plan
- [ ] 🔴 Set up CI `cc:TODO`
- [ ] Write onboarding notes
- [ ] Fix login race `cc:WIP`

## Done
- [x] Bootstrap repo `cc:完了`
- [x] Draft README
";

    fn titles(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.title.as_str()).collect()
    }

    #[test]
    fn parse_task_line_extracts_fields() {
        let parsed = parse_task_line("  - [x] 🟡 Ship it `cc:完了` ").expect("checklist");
        assert!(parsed.completed);
        assert_eq!(parsed.priority, Some(Priority::Medium));
        assert_eq!(parsed.marker.as_deref(), Some("cc:完了"));
        assert_eq!(parsed.title, "Ship it");
    }

    #[test]
    fn parse_task_line_rejects_non_checklist() {
        assert!(parse_task_line("## Plan").is_none());
        assert!(parse_task_line("- plain bullet").is_none());
        assert!(parse_task_line("- [ ]").is_none());
    }

    /// A `cc:WIP` line under a plan heading still lands in work.
    #[test]
    fn marker_beats_section() {
        let board = parse_ledger(LEDGER, WorkflowMode::Solo, None);
        assert_eq!(titles(&board.work), vec!["Fix login race"]);
        assert!(!titles(&board.plan).contains(&"Fix login race"));
    }

    #[test]
    fn section_fallback_for_unmarked_lines() {
        let board = parse_ledger(LEDGER, WorkflowMode::Solo, Some("Plans.md"));
        assert_eq!(titles(&board.plan), vec!["Set up CI", "Write onboarding notes"]);
        assert_eq!(titles(&board.done), vec!["Bootstrap repo", "Draft README"]);
        assert!(board.error.is_none());

        let unmarked = &board.plan[1];
        let source = unmarked.source.as_ref().expect("source");
        assert_eq!(source.line_number, 5);
        assert_eq!(source.original_line, "- [ ] Write onboarding notes");
        assert!(source.marker.is_none());
        assert_eq!(source.file_path.as_deref(), Some("Plans.md"));
    }

    #[test]
    fn marked_tasks_carry_source_token() {
        let board = parse_ledger(LEDGER, WorkflowMode::Solo, None);
        let task = &board.plan[0];
        assert_eq!(task.priority, Some(Priority::High));
        let source = task.source.as_ref().expect("source");
        assert_eq!(source.line_number, 4);
        assert_eq!(source.original_line, "- [ ] 🔴 Set up CI `cc:TODO`");
        assert_eq!(source.marker.as_deref(), Some("cc:TODO"));
    }

    #[test]
    fn completion_marker_depends_on_mode() {
        let text = "- [x] Feature A `cc:完了`\n- [x] Feature B `cursor:完了`\n- [x] Feature C `pm:確認済`\n";
        let solo = parse_ledger(text, WorkflowMode::Solo, None);
        assert_eq!(solo.done.len(), 3);
        assert!(solo.review.is_empty());

        let two = parse_ledger(text, WorkflowMode::TwoAgent, None);
        assert_eq!(titles(&two.review), vec!["Feature A"]);
        assert_eq!(titles(&two.done), vec!["Feature B", "Feature C"]);
    }

    #[test]
    fn unknown_marker_follows_checkbox() {
        assert_eq!(
            marker_status("cc:blocked", WorkflowMode::TwoAgent, false),
            TaskStatus::Plan
        );
        assert_eq!(
            marker_status("pm:odd", WorkflowMode::Solo, true),
            TaskStatus::Done
        );
        assert_eq!(
            marker_status("pm:依頼中", WorkflowMode::TwoAgent, false),
            TaskStatus::Plan
        );
        assert_eq!(
            marker_status("cc:作業中", WorkflowMode::Solo, false),
            TaskStatus::Work
        );
    }

    #[test]
    fn unmarked_duplicate_of_marked_title_is_skipped() {
        let text = "## Work\n- [ ] Deploy `cc:WIP`\n\n## Plan\n- [ ]  deploy \n- [ ] Other\n- [ ] other\n";
        let board = parse_ledger(text, WorkflowMode::Solo, None);
        assert_eq!(titles(&board.work), vec!["Deploy"]);
        assert_eq!(titles(&board.plan), vec!["Other"]);
    }

    #[test]
    fn lines_outside_known_sections_are_ignored() {
        let text = "## Ideas\n- [ ] Someday maybe\n";
        let board = parse_ledger(text, WorkflowMode::Solo, None);
        assert_eq!(board.total(), 0);
        assert_eq!(board.error.as_deref(), Some(NO_TASKS_ERROR));
    }

    #[test]
    fn japanese_and_emoji_headings_are_recognised() {
        let text = "## 🔴 進行中のタスク\n- [ ] A\n## 確認待ち\n- [ ] B\n## 🟢 完了\n- [x] C\n";
        let board = parse_ledger(text, WorkflowMode::TwoAgent, None);
        assert_eq!(titles(&board.work), vec!["A"]);
        assert_eq!(titles(&board.review), vec!["B"]);
        assert_eq!(titles(&board.done), vec!["C"]);
    }

    #[test]
    fn empty_ledger_reports_error() {
        let board = parse_ledger("  \n\n", WorkflowMode::Solo, None);
        assert_eq!(board.error.as_deref(), Some(EMPTY_LEDGER_ERROR));
        assert_eq!(board.total(), 0);
    }

    #[test]
    fn task_ids_are_unique() {
        let board = parse_ledger(LEDGER, WorkflowMode::Solo, None);
        let ids: HashSet<&str> = TaskStatus::ALL
            .iter()
            .flat_map(|s| board.column(*s))
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids.len(), board.total());
    }

    #[test]
    fn handoff_status_prioritises_pm_waiting() {
        let text = "- [ ] A `pm:依頼中`\n- [ ] B `cc:WIP`\n- [x] C `cc:完了`\n";
        let board = parse_ledger(text, WorkflowMode::TwoAgent, None);
        let status = handoff_status(&board);
        assert_eq!(status.state, HandoffState::PmWaiting);
        assert_eq!(status.impl_waiting, 1);
        assert_eq!(status.pm_waiting, 1);
        assert_eq!(status.in_progress, 1);

        let board = parse_ledger("- [ ] A `pm:依頼中`\n", WorkflowMode::TwoAgent, None);
        assert_eq!(handoff_status(&board).state, HandoffState::ImplWaiting);

        let board = parse_ledger("- [ ] A `cc:TODO`\n", WorkflowMode::TwoAgent, None);
        assert_eq!(handoff_status(&board).state, HandoffState::Idle);
    }
}
