//! Operational transform engine for line-oriented text documents.
//!
//! A [`DocOp`] walks a document from start to end with four kinds of
//! components (insert, delete, retain within a line, retain whole lines).
//! This module provides:
//! - the op model and a compacting [`DocOpBuilder`]
//! - [`transform`] for two ops made against the same document
//! - strict application against a rope-backed [`Document`]
//! - cursor position transformation

pub mod apply;
pub mod doc_op;
pub mod position;
pub mod transform;

pub use apply::Document;
pub use doc_op::{DocOp, DocOpBuilder, DocOpComponent};
pub use position::{DocumentSelection, FilePosition, PositionTransformer};
pub use transform::{transform, OperationPair};

/// Result type for OT operations
pub type OtResult<T> = Result<T, OtError>;

/// Errors raised by the OT engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    /// The two ops do not describe the same document
    #[error("Transform mismatch: {0}")]
    TransformMismatch(String),

    /// The op does not match the document it is applied to
    #[error("Apply mismatch: {0}")]
    ApplyMismatch(String),

    /// A component breaks the structural rules of a DocOp
    #[error("Invalid component: {0}")]
    InvalidComponent(String),

    /// A serialized DocOp could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for OtError {
    fn from(err: serde_json::Error) -> Self {
        OtError::Parse(err.to_string())
    }
}

/// Number of chars in `text`. All component lengths count chars.
pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` after `n` chars.
pub(crate) fn split_chars(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chars_multibyte() {
        assert_eq!(split_chars("héllo", 2), ("hé", "llo"));
        assert_eq!(split_chars("ab", 5), ("ab", ""));
        assert_eq!(char_len("héllo\n"), 6);
    }

    #[test]
    fn test_error_display() {
        let err = OtError::ApplyMismatch("delete text differs".to_string());
        assert_eq!(err.to_string(), "Apply mismatch: delete text differs");
    }
}
