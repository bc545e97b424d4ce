//! DocOp model and the compacting builder.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{OtError, OtResult};

/// One step of a [`DocOp`] walk over a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocOpComponent {
    /// Insert text at the cursor. A `\n` may only be the last char.
    Insert(String),
    /// Delete text at the cursor. The text must match the document.
    Delete(String),
    /// Keep `count` chars of the current line.
    #[serde(rename_all = "camelCase")]
    Retain {
        count: usize,
        has_trailing_newline: bool,
    },
    /// Keep the rest of the current line and `n - 1` whole lines after it.
    RetainLine(usize),
}

impl DocOpComponent {
    pub fn is_mutation(&self) -> bool {
        matches!(self, DocOpComponent::Insert(_) | DocOpComponent::Delete(_))
    }

    fn validate(&self) -> OtResult<()> {
        match self {
            DocOpComponent::Insert(text) | DocOpComponent::Delete(text) => {
                if text.is_empty() {
                    return Err(OtError::InvalidComponent("empty text".to_string()));
                }
                if let Some(idx) = text.find('\n') {
                    if idx != text.len() - 1 {
                        return Err(OtError::InvalidComponent(format!(
                            "newline before end of text {:?}",
                            text
                        )));
                    }
                }
                Ok(())
            }
            DocOpComponent::Retain { count, .. } if *count == 0 => {
                Err(OtError::InvalidComponent("retain of zero chars".to_string()))
            }
            DocOpComponent::RetainLine(0) => Err(OtError::InvalidComponent(
                "retain line of zero lines".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// An ordered list of components that walks a whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocOp {
    components: Vec<DocOpComponent>,
}

impl DocOp {
    pub fn new(components: Vec<DocOpComponent>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[DocOpComponent] {
        &self.components
    }

    pub fn into_components(self) -> Vec<DocOpComponent> {
        self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True if applying the op changes the text.
    pub fn has_mutation(&self) -> bool {
        self.components.iter().any(DocOpComponent::is_mutation)
    }

    /// Check the structural rules every component must follow.
    pub fn validate(&self) -> OtResult<()> {
        self.components.iter().try_for_each(DocOpComponent::validate)
    }

    /// Serialize to the JSON form carried in `docOps` string lists.
    pub fn to_json(&self) -> OtResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a serialized DocOp.
    pub fn from_json(json: &str) -> OtResult<Self> {
        let op: DocOp = serde_json::from_str(json)?;
        op.validate()?;
        Ok(op)
    }
}

impl fmt::Display for DocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match component {
                DocOpComponent::Insert(text) => write!(f, "I({:?})", text)?,
                DocOpComponent::Delete(text) => write!(f, "D({:?})", text)?,
                DocOpComponent::Retain {
                    count,
                    has_trailing_newline: true,
                } => write!(f, "R({}\\n)", count)?,
                DocOpComponent::Retain { count, .. } => write!(f, "R({})", count)?,
                DocOpComponent::RetainLine(lines) => write!(f, "RL({})", lines)?,
            }
        }
        Ok(())
    }
}

/// Builds a [`DocOp`] while compacting adjacent components.
///
/// Consecutive inserts (or deletes) merge until one ends a line, consecutive
/// single-line retains merge, and a line that is only retained collapses
/// into a `RetainLine`.
#[derive(Debug, Default)]
pub struct DocOpBuilder {
    components: Vec<DocOpComponent>,
    pending: Option<DocOpComponent>,
    cur_line_has_non_retain: bool,
}

impl DocOpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert text, splitting it at line ends.
    pub fn insert(&mut self, text: &str) -> &mut Self {
        for chunk in text.split_inclusive('\n') {
            self.push_insert(chunk);
        }
        self
    }

    /// Delete text, splitting it at line ends.
    pub fn delete(&mut self, text: &str) -> &mut Self {
        for chunk in text.split_inclusive('\n') {
            self.push_delete(chunk);
        }
        self
    }

    pub fn retain(&mut self, count: usize, has_trailing_newline: bool) -> &mut Self {
        if count == 0 {
            return self;
        }

        if has_trailing_newline && !self.cur_line_has_non_retain {
            if let Some(DocOpComponent::Retain {
                has_trailing_newline: false,
                ..
            }) = self.pending
            {
                self.pending = None;
            }
            return self.retain_line(1);
        }

        match &mut self.pending {
            Some(DocOpComponent::Retain {
                count: pending_count,
                has_trailing_newline: pending_nl,
            }) if !*pending_nl => {
                *pending_count += count;
                *pending_nl = has_trailing_newline;
            }
            _ => {
                self.commit();
                self.pending = Some(DocOpComponent::Retain {
                    count,
                    has_trailing_newline,
                });
            }
        }

        if has_trailing_newline {
            self.cur_line_has_non_retain = false;
        }
        self
    }

    pub fn retain_line(&mut self, lines: usize) -> &mut Self {
        if lines == 0 {
            return self;
        }

        match &mut self.pending {
            Some(DocOpComponent::RetainLine(pending)) => *pending += lines,
            _ => {
                self.commit();
                self.pending = Some(DocOpComponent::RetainLine(lines));
            }
        }
        self.cur_line_has_non_retain = false;
        self
    }

    pub fn build(&mut self) -> DocOp {
        self.commit();
        self.cur_line_has_non_retain = false;
        DocOp::new(std::mem::take(&mut self.components))
    }

    fn push_insert(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match &mut self.pending {
            Some(DocOpComponent::Insert(text)) if !text.ends_with('\n') => text.push_str(chunk),
            _ => {
                self.commit();
                self.pending = Some(DocOpComponent::Insert(chunk.to_string()));
            }
        }
        self.cur_line_has_non_retain = !chunk.ends_with('\n');
    }

    fn push_delete(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match &mut self.pending {
            Some(DocOpComponent::Delete(text)) if !text.ends_with('\n') => text.push_str(chunk),
            _ => {
                self.commit();
                self.pending = Some(DocOpComponent::Delete(chunk.to_string()));
            }
        }
        self.cur_line_has_non_retain = !chunk.ends_with('\n');
    }

    fn commit(&mut self) {
        if let Some(component) = self.pending.take() {
            self.components.push(component);
        }
    }
}
