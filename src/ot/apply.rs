//! Rope-backed text buffer with strict DocOp application.

use ropey::Rope;

use super::doc_op::{DocOp, DocOpBuilder, DocOpComponent};
use super::{char_len, OtError, OtResult};

/// Text buffer a DocOp is applied to. Lines end with `\n`; the last line has
/// no terminator.
#[derive(Debug, Clone, Default)]
pub struct Document {
    rope: Rope,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
        }
    }

    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn len_bytes(&self) -> usize {
        self.rope.len_bytes()
    }

    /// Number of lines, counting only `\n` as a terminator.
    pub fn line_count(&self) -> usize {
        self.rope.chars().filter(|c| *c == '\n').count() + 1
    }

    /// Apply `op`. The op must walk the whole document; on any mismatch the
    /// document is left as it was.
    pub fn apply(&mut self, op: &DocOp) -> OtResult<()> {
        let mut rope = self.rope.clone();
        let mut cursor = 0usize;
        let mut at_end = false;

        for component in op.components() {
            if at_end {
                return Err(OtError::ApplyMismatch(
                    "component after the end of the document".to_string(),
                ));
            }

            match component {
                DocOpComponent::Insert(text) => {
                    rope.insert(cursor, text);
                    cursor += char_len(text);
                }
                DocOpComponent::Delete(text) => {
                    let end = cursor + char_len(text);
                    if end > rope.len_chars() {
                        return Err(OtError::ApplyMismatch(format!(
                            "delete of {:?} runs past the end of the document",
                            text
                        )));
                    }
                    if rope.slice(cursor..end) != text.as_str() {
                        return Err(OtError::ApplyMismatch(format!(
                            "delete of {:?} does not match {:?}",
                            text,
                            rope.slice(cursor..end).to_string()
                        )));
                    }
                    rope.remove(cursor..end);
                }
                DocOpComponent::Retain {
                    count,
                    has_trailing_newline,
                } => {
                    let end = cursor + count;
                    if end > rope.len_chars() {
                        return Err(OtError::ApplyMismatch(format!(
                            "retain of {} runs past the end of the document",
                            count
                        )));
                    }
                    let newline_at = rope.slice(cursor..end).chars().position(|c| c == '\n');
                    let expected = has_trailing_newline.then(|| count - 1);
                    if newline_at != expected {
                        return Err(OtError::ApplyMismatch(format!(
                            "retain of {} does not line up with a line end",
                            count
                        )));
                    }
                    cursor = end;
                }
                DocOpComponent::RetainLine(lines) => {
                    cursor = skip_lines(&rope, cursor, *lines)?;
                    at_end = cursor == rope.len_chars() && !ends_after_newline(&rope, cursor);
                }
            }
        }

        if cursor != rope.len_chars() {
            return Err(OtError::ApplyMismatch(format!(
                "op stops at char {} of {}",
                cursor,
                rope.len_chars()
            )));
        }

        self.rope = rope;
        Ok(())
    }

    /// Op inserting `text` at (`line`, `column`).
    pub fn insert_op(&self, line: usize, column: usize, text: &str) -> OtResult<DocOp> {
        let start = self.char_index(line, column)?;
        let mut builder = DocOpBuilder::new();
        self.retain_range(&mut builder, 0, start);
        builder.insert(text);
        self.retain_rest(&mut builder, start);
        Ok(builder.build())
    }

    /// Op deleting `len` chars starting at (`line`, `column`).
    pub fn delete_op(&self, line: usize, column: usize, len: usize) -> OtResult<DocOp> {
        let start = self.char_index(line, column)?;
        let end = start + len;
        if end > self.len_chars() {
            return Err(OtError::InvalidComponent(format!(
                "delete of {} chars runs past the end of the document",
                len
            )));
        }
        let mut builder = DocOpBuilder::new();
        self.retain_range(&mut builder, 0, start);
        builder.delete(&self.rope.slice(start..end).to_string());
        self.retain_rest(&mut builder, end);
        Ok(builder.build())
    }

    fn char_index(&self, line: usize, column: usize) -> OtResult<usize> {
        let mut index = 0;
        let mut current_line = 0;
        for c in self.rope.chars() {
            if current_line == line {
                break;
            }
            index += 1;
            if c == '\n' {
                current_line += 1;
            }
        }
        if current_line != line {
            return Err(OtError::InvalidComponent(format!("no line {}", line)));
        }
        let line_len = self
            .rope
            .chars_at(index)
            .take_while(|c| *c != '\n')
            .count();
        if column > line_len {
            return Err(OtError::InvalidComponent(format!(
                "column {} is past the end of line {}",
                column, line
            )));
        }
        Ok(index + column)
    }

    /// Emit retains covering chars `start..end`, one component per line.
    fn retain_range(&self, builder: &mut DocOpBuilder, start: usize, end: usize) {
        let run = self.retain_full_lines(builder, start, end);
        builder.retain(run, false);
    }

    /// Emit retains covering everything from `start` to the end.
    fn retain_rest(&self, builder: &mut DocOpBuilder, start: usize) {
        self.retain_full_lines(builder, start, self.len_chars());
        builder.retain_line(1);
    }

    fn retain_full_lines(&self, builder: &mut DocOpBuilder, start: usize, end: usize) -> usize {
        let mut run = 0;
        for c in self.rope.slice(start..end).chars() {
            run += 1;
            if c == '\n' {
                builder.retain(run, true);
                run = 0;
            }
        }
        run
    }
}

/// Cursor after skipping the rest of the current line and `lines - 1` more.
fn skip_lines(rope: &Rope, cursor: usize, lines: usize) -> OtResult<usize> {
    let mut remaining = lines;
    let mut position = cursor;
    for c in rope.chars_at(cursor) {
        position += 1;
        if c == '\n' {
            remaining -= 1;
            if remaining == 0 {
                return Ok(position);
            }
        }
    }
    if remaining == 1 {
        Ok(rope.len_chars())
    } else {
        Err(OtError::ApplyMismatch(format!(
            "retain line of {} lines runs past the end of the document",
            lines
        )))
    }
}

/// True when `cursor` sits right after a `\n`, i.e. an empty last line still
/// has to be walked.
fn ends_after_newline(rope: &Rope, cursor: usize) -> bool {
    cursor > 0 && rope.char(cursor - 1) == '\n'
}
