//! Per-deployment working directories

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;

/// Hands out one scratch directory per deployment under a common root
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: Dir,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Dir::new(root),
        }
    }

    /// Path of the workspace for a deployment. The directory itself is left
    /// for `git clone` to create.
    pub async fn prepare(&self, deployment_id: &str) -> Result<PathBuf, DeployError> {
        self.root.create().await?;

        let workspace = self.root.subdir(deployment_id);
        if workspace.exists().await {
            warn!(
                "Workspace {} already exists, removing it",
                workspace.path().display()
            );
            workspace.delete().await?;
        }

        Ok(workspace.path().to_path_buf())
    }

    /// Delete everything under the root. Only safe before any deployment starts.
    pub async fn sweep(&self) -> Result<usize, DeployError> {
        if !self.root.exists().await {
            return Ok(0);
        }

        let mut removed = 0;
        for path in self.root.entries().await? {
            let result = match fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
                Ok(_) => fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "Failed to remove stale workspace {}: {}",
                    path.display(),
                    e
                ),
            }
        }

        if removed > 0 {
            info!(
                "Removed {} stale workspace(s) from {}",
                removed,
                self.root.path().display()
            );
        }
        Ok(removed)
    }

    /// Delete a deployment's workspace. Failures are logged, not returned.
    pub async fn reclaim(&self, deployment_id: &str) {
        let workspace = self.root.subdir(deployment_id);
        match workspace.delete().await {
            Ok(()) => debug!("Reclaimed workspace {}", workspace.path().display()),
            Err(e) => warn!(
                "Failed to reclaim workspace {}: {}",
                workspace.path().display(),
                e
            ),
        }
    }
}
