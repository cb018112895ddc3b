//! Optimistic-concurrency marker rewrite on ledger text.
//!
//! Pure function over the file contents: the caller reads the ledger, applies
//! the edit here and persists `MarkerEdit::content` only on success.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEdit {
    pub old_line: String,
    pub new_line: String,
    /// Full ledger text with the edited line in place.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerEditError {
    LineOutOfRange { line_number: usize, line_count: usize },
    /// The live line differs from what the caller last observed.
    Conflict { expected_line: String, current_line: String },
    MarkerNotFound { marker: String, current_line: String },
}

/// Replace the first backtick-quoted `old_marker` on `line_number` (1-based).
///
/// The live line must equal `expected_line` byte-for-byte. Other lines are
/// preserved exactly, including their line endings.
pub fn apply_marker_edit(
    content: &str,
    line_number: usize,
    expected_line: &str,
    old_marker: &str,
    new_marker: &str,
) -> Result<MarkerEdit, MarkerEditError> {
    let lines: Vec<&str> = content.split('\n').collect();
    let index = line_number
        .checked_sub(1)
        .filter(|i| *i < lines.len())
        .ok_or(MarkerEditError::LineOutOfRange {
            line_number,
            line_count: lines.len(),
        })?;

    let current = lines[index];
    if current != expected_line {
        return Err(MarkerEditError::Conflict {
            expected_line: expected_line.to_string(),
            current_line: current.to_string(),
        });
    }

    let quoted_old = format!("`{old_marker}`");
    if !current.contains(&quoted_old) {
        return Err(MarkerEditError::MarkerNotFound {
            marker: old_marker.to_string(),
            current_line: current.to_string(),
        });
    }
    let new_line = current.replacen(&quoted_old, &format!("`{new_marker}`"), 1);
    let content = lines
        .iter()
        .enumerate()
        .map(|(i, line)| if i == index { new_line.as_str() } else { *line })
        .collect::<Vec<_>>()
        .join("\n");

    Ok(MarkerEdit {
        old_line: current.to_string(),
        new_line,
        content,
    })
}
