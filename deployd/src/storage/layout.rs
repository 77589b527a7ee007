//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the service
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn base(&self) -> Dir {
        Dir::new(self.base_dir.clone())
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        self.base().file("settings.json")
    }

    /// The serving location; publishes swap trees in and out of this path
    pub fn serving_dir(&self) -> Dir {
        self.base().subdir("static")
    }

    /// Parent of the per-deployment workspaces
    pub fn workspaces_dir(&self) -> Dir {
        self.base().subdir("workspaces")
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        self.base().subdir("logs")
    }

    /// Setup the storage layout (create directories).
    ///
    /// The serving location is left alone so an interrupted publish can still
    /// be recovered; create it after recovery.
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.base().create().await?;
        self.workspaces_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/deployd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deployd");

        Self::new(base_dir)
    }
}
