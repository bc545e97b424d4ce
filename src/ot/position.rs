//! Moving cursor positions through a DocOp.

use serde::{Deserialize, Serialize};

use super::doc_op::{DocOp, DocOpComponent};

/// Zero-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePosition {
    pub line_number: usize,
    pub column: usize,
}

impl FilePosition {
    pub fn new(line_number: usize, column: usize) -> Self {
        Self {
            line_number,
            column,
        }
    }
}

/// A collaborator's selection travelling beside a DocOp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSelection {
    pub user_id: String,
    pub base_position: FilePosition,
    pub cursor_position: FilePosition,
}

impl DocumentSelection {
    /// Move both ends of the selection through `op`.
    pub fn transform(&self, op: &DocOp) -> Self {
        Self {
            user_id: self.user_id.clone(),
            base_position: PositionTransformer::new(self.base_position).transform(op),
            cursor_position: PositionTransformer::new(self.cursor_position).transform(op),
        }
    }
}

/// Tracks where a position made against a document ends up once an op is
/// applied to it.
#[derive(Debug, Clone, Copy)]
pub struct PositionTransformer {
    position: FilePosition,
}

impl PositionTransformer {
    pub fn new(position: FilePosition) -> Self {
        Self { position }
    }

    pub fn position(&self) -> FilePosition {
        self.position
    }

    pub fn transform(&mut self, op: &DocOp) -> FilePosition {
        let target = self.position;
        // Cursor in the original document and in the result.
        let (mut old_line, mut old_col) = (0usize, 0usize);
        let (mut new_line, mut new_col) = (0usize, 0usize);

        for component in op.components() {
            match component {
                DocOpComponent::Retain {
                    count,
                    has_trailing_newline,
                } => {
                    if old_line == target.line_number && old_col + count > target.column {
                        self.position = FilePosition::new(
                            new_line,
                            new_col + target.column.saturating_sub(old_col),
                        );
                        return self.position;
                    }
                    if *has_trailing_newline {
                        old_line += 1;
                        old_col = 0;
                        new_line += 1;
                        new_col = 0;
                    } else {
                        old_col += count;
                        new_col += count;
                    }
                }
                DocOpComponent::RetainLine(lines) => {
                    if target.line_number < old_line + lines {
                        break;
                    }
                    old_line += lines;
                    new_line += lines;
                    old_col = 0;
                    new_col = 0;
                }
                DocOpComponent::Insert(text) => {
                    for c in text.chars() {
                        if c == '\n' {
                            new_line += 1;
                            new_col = 0;
                        } else {
                            new_col += 1;
                        }
                    }
                }
                DocOpComponent::Delete(text) => {
                    let (start_line, start_col) = (old_line, old_col);
                    for c in text.chars() {
                        if c == '\n' {
                            old_line += 1;
                            old_col = 0;
                        } else {
                            old_col += 1;
                        }
                    }
                    let at = (target.line_number, target.column);
                    let after_start = at >= (start_line, start_col);
                    let before_end = at < (old_line, old_col);
                    if after_start && before_end {
                        self.position = FilePosition::new(new_line, new_col);
                        return self.position;
                    }
                }
            }
        }

        self.position = if target.line_number == old_line {
            FilePosition::new(new_line, new_col + target.column.saturating_sub(old_col))
        } else {
            FilePosition::new(
                new_line + target.line_number.saturating_sub(old_line),
                target.column,
            )
        };
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::DocOpBuilder;

    fn moved(line: usize, column: usize, op: DocOp) -> (usize, usize) {
        let p = PositionTransformer::new(FilePosition::new(line, column)).transform(&op);
        (p.line_number, p.column)
    }

    #[test]
    fn test_delete_scenarios() {
        assert_eq!(moved(0, 5, DocOpBuilder::new().delete("h").build()), (0, 4));
        assert_eq!(moved(0, 1, DocOpBuilder::new().delete("h").build()), (0, 0));
        assert_eq!(moved(0, 1, DocOpBuilder::new().delete("hello").build()), (0, 0));
        assert_eq!(
            moved(0, 0, DocOpBuilder::new().retain(5, false).delete("hello").build()),
            (0, 0)
        );
        assert_eq!(moved(1, 1, DocOpBuilder::new().delete("hello\n").build()), (0, 1));
        assert_eq!(moved(0, 1, DocOpBuilder::new().delete("h\n").build()), (0, 0));
        assert_eq!(
            moved(
                5,
                1,
                DocOpBuilder::new().retain_line(3).delete("\n").retain_line(5).build()
            ),
            (4, 1)
        );
    }

    #[test]
    fn test_insert_scenarios() {
        assert_eq!(moved(0, 1, DocOpBuilder::new().insert("hello").build()), (0, 6));
        assert_eq!(moved(0, 0, DocOpBuilder::new().insert("hello").build()), (0, 5));
        assert_eq!(
            moved(0, 0, DocOpBuilder::new().retain(5, false).insert("hello").build()),
            (0, 0)
        );
        assert_eq!(moved(0, 1, DocOpBuilder::new().insert("hello\n").build()), (1, 1));
        assert_eq!(moved(4, 1, DocOpBuilder::new().insert("hello\n").build()), (5, 1));
        assert_eq!(moved(0, 0, DocOpBuilder::new().insert("hello\n").build()), (1, 0));
    }

    #[test]
    fn test_retain_scenarios() {
        assert_eq!(moved(0, 5, DocOpBuilder::new().retain(4, false).build()), (0, 5));
        assert_eq!(moved(0, 5, DocOpBuilder::new().retain(40, false).build()), (0, 5));
        assert_eq!(moved(4, 5, DocOpBuilder::new().retain_line(2).build()), (4, 5));
        assert_eq!(moved(0, 5, DocOpBuilder::new().retain_line(40).build()), (0, 5));
    }

    #[test]
    fn test_selection_moves_both_ends() {
        let selection = DocumentSelection {
            user_id: "u1".to_string(),
            base_position: FilePosition::new(0, 1),
            cursor_position: FilePosition::new(1, 2),
        };
        let op = DocOpBuilder::new().insert("ab\n").retain_line(2).build();
        let moved = selection.transform(&op);
        assert_eq!(moved.base_position, FilePosition::new(1, 1));
        assert_eq!(moved.cursor_position, FilePosition::new(2, 2));
    }
}
