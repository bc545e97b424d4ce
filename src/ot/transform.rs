//! Transformation of two DocOps made against the same document.
//!
//! Each side is walked component by component. At every step the pair of
//! current components decides what both outputs receive; a pair one side
//! does not know how to resolve is handed to the other side with the roles
//! swapped. When both sides insert at the same place the client's insert
//! goes first.

use super::doc_op::{DocOp, DocOpBuilder, DocOpComponent};
use super::{char_len, split_chars, OtError, OtResult};

/// Result of [`transform`]: the client op rebased onto the server op and the
/// server op rebased onto the client op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPair {
    pub client_op: DocOp,
    pub server_op: DocOp,
}

/// Transform `client_op` and `server_op`, both made against the same
/// document, so that `server_op` then `client_op'` and `client_op` then
/// `server_op'` produce the same text.
pub fn transform(client_op: &DocOp, server_op: &DocOp) -> OtResult<OperationPair> {
    let mut client = Side::new(client_op);
    let mut server = Side::new(server_op);

    loop {
        client.load_next();
        server.load_next();
        if client.exhausted() && server.exhausted() {
            break;
        }

        step(&mut client, &mut server)?;

        client.end_step();
        server.end_step();
    }

    Ok(OperationPair {
        client_op: client.out.build(),
        server_op: server.out.build(),
    })
}

/// The component a side is currently working through.
#[derive(Debug)]
enum Cursor {
    Delete(String),
    Insert(String),
    Retain { count: usize, has_trailing_newline: bool },
    RetainLine { lines: usize, substitute_len: usize },
    Finished,
}

impl Cursor {
    fn from_component(component: &DocOpComponent) -> Self {
        match component {
            DocOpComponent::Delete(text) => Cursor::Delete(text.clone()),
            DocOpComponent::Insert(text) => Cursor::Insert(text.clone()),
            DocOpComponent::Retain {
                count,
                has_trailing_newline,
            } => Cursor::Retain {
                count: *count,
                has_trailing_newline: *has_trailing_newline,
            },
            DocOpComponent::RetainLine(lines) => Cursor::RetainLine {
                lines: *lines,
                substitute_len: 0,
            },
        }
    }
}

struct Side<'a> {
    components: std::slice::Iter<'a, DocOpComponent>,
    cursor: Option<Cursor>,
    out: DocOpBuilder,
    finished: bool,
    cur_insert_newline: bool,
    prev_insert_newline: bool,
}

impl<'a> Side<'a> {
    fn new(op: &'a DocOp) -> Self {
        Self {
            components: op.components().iter(),
            cursor: None,
            out: DocOpBuilder::new(),
            finished: false,
            cur_insert_newline: false,
            prev_insert_newline: false,
        }
    }

    fn load_next(&mut self) {
        if self.cursor.is_none() {
            self.cursor = Some(match self.components.next() {
                Some(component) => Cursor::from_component(component),
                None => Cursor::Finished,
            });
        }
    }

    fn exhausted(&self) -> bool {
        matches!(self.cursor, Some(Cursor::Finished))
    }

    fn end_step(&mut self) {
        if self.finished {
            self.cursor = None;
        }
        self.finished = false;
        self.prev_insert_newline = self.cur_insert_newline;
        self.cur_insert_newline = false;
    }
}

fn mismatch(component: &str) -> OtError {
    OtError::TransformMismatch(format!("{} runs past the end of the other op", component))
}

/// Pairs resolved from the other side's point of view.
fn resolved_by_other(mine: Option<&Cursor>, theirs: Option<&Cursor>) -> bool {
    use Cursor::*;

    matches!(
        (mine, theirs),
        (Some(Finished), Some(Delete(_) | Insert(_) | Retain { .. } | RetainLine { .. }))
            | (Some(Delete(_)), Some(Insert(_) | RetainLine { .. }))
            | (Some(Insert(_)), Some(RetainLine { .. }))
            | (Some(Retain { .. }), Some(Delete(_) | Insert(_) | RetainLine { .. }))
    )
}

fn step(me: &mut Side<'_>, other: &mut Side<'_>) -> OtResult<()> {
    use Cursor::*;

    if resolved_by_other(me.cursor.as_ref(), other.cursor.as_ref()) {
        return step(other, me);
    }

    let (Some(mine), Some(theirs)) = (me.cursor.as_mut(), other.cursor.as_mut()) else {
        return Err(OtError::TransformMismatch("missing cursor".to_string()));
    };

    match (mine, theirs) {
        (Finished, Finished) => Err(OtError::TransformMismatch(
            "both ops already finished".to_string(),
        )),
        (Finished, _)
        | (Delete(_) | Retain { .. }, Insert(_) | RetainLine { .. })
        | (Insert(_), RetainLine { .. })
        | (Retain { .. }, Delete(_)) => Err(OtError::TransformMismatch(
            "component pair resolved out of turn".to_string(),
        )),

        (Delete(_), Finished) => Err(mismatch("delete")),
        (Retain { .. }, Finished) => Err(mismatch("retain")),

        (Delete(text), Delete(other_text)) => {
            let len = char_len(text);
            let other_len = char_len(other_text);
            if len == other_len {
                me.finished = true;
                other.finished = true;
            } else if len < other_len {
                *other_text = split_chars(other_text, len).1.to_string();
                me.finished = true;
            } else {
                *text = split_chars(text, other_len).1.to_string();
                other.finished = true;
            }
            Ok(())
        }

        (Delete(text), Retain { count, .. }) => {
            let len = char_len(text);
            let common = len.min(*count);
            let (head, tail) = split_chars(text, common);
            me.out.delete(head);
            let tail = tail.to_string();
            *count -= common;
            if *count == 0 {
                other.finished = true;
            }
            if tail.is_empty() {
                me.finished = true;
            } else {
                *text = tail;
            }
            Ok(())
        }

        (Insert(text), _) => {
            me.out.insert(text);
            let ends_line = text.ends_with('\n');
            other.out.retain(char_len(text), ends_line);
            if ends_line {
                me.cur_insert_newline = true;
            }
            me.finished = true;
            Ok(())
        }

        (
            Retain {
                count,
                has_trailing_newline,
            },
            Retain {
                count: other_count,
                has_trailing_newline: other_newline,
            },
        ) => {
            let common = (*count).min(*other_count);
            me.out
                .retain(common, common == *count && *has_trailing_newline);
            other
                .out
                .retain(common, common == *other_count && *other_newline);
            *count -= common;
            *other_count -= common;
            if *count == 0 {
                me.finished = true;
            }
            if *other_count == 0 {
                other.finished = true;
            }
            Ok(())
        }

        (
            RetainLine {
                lines,
                substitute_len,
            },
            theirs,
        ) => match theirs {
            Delete(other_text) => {
                other.out.delete(other_text);
                if other_text.ends_with('\n') {
                    me.finished = line_end(&mut me.out, lines, substitute_len, false);
                }
                other.finished = true;
                Ok(())
            }
            Finished => {
                if *lines != 1 {
                    return Err(OtError::TransformMismatch(format!(
                        "retain line of {} lines past the end of the other op",
                        lines
                    )));
                }
                if me.prev_insert_newline {
                    other.out.retain_line(1);
                }
                *lines = 0;
                me.out.retain_line(1);
                me.finished = true;
                Ok(())
            }
            Insert(other_text) => {
                other.out.insert(other_text);
                if other_text.ends_with('\n') {
                    *lines += 1;
                    me.finished = line_end(&mut me.out, lines, substitute_len, true);
                    other.cur_insert_newline = true;
                } else {
                    *substitute_len += char_len(other_text);
                }
                other.finished = true;
                Ok(())
            }
            Retain {
                count,
                has_trailing_newline,
            } => {
                other.out.retain(*count, *has_trailing_newline);
                *substitute_len += *count;
                if *has_trailing_newline {
                    me.finished = line_end(&mut me.out, lines, substitute_len, true);
                }
                other.finished = true;
                Ok(())
            }
            RetainLine {
                lines: other_lines,
                substitute_len: other_substitute_len,
            } => {
                let common = (*lines).min(*other_lines);
                me.out.retain_line(common);
                other.out.retain_line(common);
                if common > 0 {
                    // The retained lines cover whatever was already counted
                    // on the current line.
                    *substitute_len = 0;
                    *other_substitute_len = 0;
                }
                *lines -= common;
                *other_lines -= common;
                if *lines == 0 {
                    me.finished = true;
                }
                if *other_lines == 0 {
                    other.finished = true;
                }
                Ok(())
            }
        },
    }
}

/// Close one line of a retain-line run. Returns true once every line of the
/// run has been closed.
fn line_end(
    out: &mut DocOpBuilder,
    lines: &mut usize,
    substitute_len: &mut usize,
    can_use_retain_line: bool,
) -> bool {
    if can_use_retain_line {
        out.retain_line(1);
    } else if *substitute_len > 0 {
        out.retain(*substitute_len, false);
    }
    *lines -= 1;
    *substitute_len = 0;
    *lines == 0
}
