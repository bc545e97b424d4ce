//! Workspace module for the server's authoritative directory tree.
//!
//! This module handles:
//! - Scanning the workspace directory into an id-indexed tree
//! - Stable resource ids that double as file edit session keys
//! - Directory listings with a depth cut-off
//! - Applying ADD/DELETE/MOVE/COPY mutations to disk and to the tree

mod tree;

pub use tree::{AppliedUpdate, NodeKind, ScanSummary, WorkspaceNode, WorkspaceTree};

use crate::storage::StorageError;

/// Path of the workspace root
pub const ROOT_PATH: &str = "/";

/// Errors that can occur during workspace tree operations
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    PathExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Cannot modify the workspace root")]
    CannotModifyRoot,

    #[error("Cannot move node to its own descendant")]
    CircularMove,

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Options for directory scanning
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files larger than this are left out of the tree (bytes)
    pub max_file_size: u64,
    /// File/folder patterns to exclude
    pub exclude_patterns: Vec<String>,
    /// Maximum depth to scan (0 = unlimited)
    pub max_depth: usize,
    /// Maximum number of files to scan
    pub max_files: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024, // 10MB
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
                "__pycache__".to_string(),
                ".DS_Store".to_string(),
                "*.pyc".to_string(),
                "*.so".to_string(),
                "*.dll".to_string(),
                "*.exe".to_string(),
            ],
            max_depth: 20,
            max_files: 10000,
        }
    }
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Check if a path should be excluded based on patterns
    pub fn should_exclude(&self, path: &str, name: &str) -> bool {
        for pattern in &self.exclude_patterns {
            if let Some(suffix) = pattern.strip_prefix('*') {
                if name.ends_with(suffix) {
                    return true;
                }
            } else if name == pattern || path.split('/').any(|part| part == pattern) {
                return true;
            }
        }
        false
    }
}

/// Check if a file is likely binary based on extension
pub fn is_binary_extension(path: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();

    matches!(
        ext.as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "ico" | "webp"
            | "mp3" | "mp4" | "wav" | "ogg" | "webm" | "avi" | "mov"
            | "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx"
            | "zip" | "tar" | "gz" | "rar" | "7z" | "bz2"
            | "exe" | "dll" | "so" | "dylib" | "bin"
            | "ttf" | "otf" | "woff" | "woff2" | "eot"
            | "sqlite" | "db" | "sqlite3"
            | "pyc" | "class" | "o" | "obj" | "wasm"
    )
}

/// Canonical form of a workspace path: leading `/`, no trailing `/`, no
/// empty or `.` segments.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// Parent of a workspace path, `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    let path = normalize_path(path);
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last segment of a workspace path
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

pub fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}
