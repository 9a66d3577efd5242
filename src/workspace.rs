//! Per-session directories holding the submitted source file.

use crate::error::WorkspaceError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Owns the root under which every session gets its own directory.
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
    source_file: String,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>, source_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            source_file: source_file.into(),
        }
    }

    /// Directory for `key`. Keys are restricted to `[A-Za-z0-9_-]` so that the
    /// mapping is injective and can never escape the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, WorkspaceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WorkspaceError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Create the session directory (and parents) if needed.
    pub async fn ensure(&self, key: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|source| WorkspaceError::Io {
                action: "create",
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Overwrite the source file inside `dir` with `text`.
    pub async fn write_source(&self, dir: &Path, text: &str) -> Result<PathBuf, WorkspaceError> {
        let path = dir.join(&self.source_file);
        fs::write(&path, text)
            .await
            .map_err(|source| WorkspaceError::Io {
                action: "write",
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), bytes = text.len(), "Source written");
        Ok(path)
    }

    /// Recursively remove `dir`. Missing directories are fine; other failures
    /// are logged and swallowed.
    pub async fn destroy(&self, dir: &Path) {
        match fs::remove_dir_all(dir).await {
            Ok(()) => debug!(path = %dir.display(), "Workspace removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "Cleanup error"),
        }
    }
}
