//! File contents storage.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{StorageError, StorageResult};

/// Where saved file contents live. Paths are workspace paths (`/src/a.rs`).
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> StorageResult<String>;

    async fn write(&self, path: &str, contents: &str) -> StorageResult<()>;
}

/// File store rooted at a directory on the local disk.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a workspace path onto the disk, refusing anything that would
    /// leave the root.
    pub fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl FileStore for DiskStore {
    async fn read(&self, path: &str) -> StorageResult<String> {
        let local = self.resolve(path)?;
        match tokio::fs::read_to_string(&local).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, contents: &str) -> StorageResult<()> {
        let local = self.resolve(path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, contents).await?;
        debug!("Wrote {} bytes to {}", contents.len(), path);
        Ok(())
    }
}
