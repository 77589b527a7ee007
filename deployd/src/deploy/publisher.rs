//! Atomic publishing of build output into the serving location
//!
//! The serving location is a single directory that the static file server
//! reads from. A new tree is copied next to it, the live tree is renamed
//! aside, and the new tree is renamed into place. Renames within one volume
//! are metadata operations, so readers never observe a half-copied tree.
//!
//! ```text
//! <parent>/.<name>.staging-<id>   copy of the build output
//! <parent>/<name>                 live tree
//! <parent>/.<name>.previous-<id>  live tree while the swap is in flight
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Publish failures
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to stage build output: {0}")]
    Staging(#[source] io::Error),

    #[error("failed to move the live tree aside: {0}")]
    MoveAside(#[source] io::Error),

    #[error("failed to swap in the new tree, previous tree restored: {cause}")]
    Failed {
        #[source]
        cause: io::Error,
    },

    #[error(
        "failed to swap in the new tree and failed to restore the previous one \
         (serving location needs operator attention): {cause}; rollback: {rollback}"
    )]
    Unrecoverable { cause: io::Error, rollback: io::Error },
}

impl PublishError {
    /// The serving location may be missing or inconsistent
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, PublishError::Unrecoverable { .. })
    }
}

/// Result of a successful publish
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub serving: PathBuf,
    pub files: u64,
    /// Cleanup problems that did not fail the publish
    pub warnings: Vec<String>,
}

/// Result of startup recovery
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Tree moved back into the serving location
    pub restored: Option<PathBuf>,
    /// Leftover staging/previous trees deleted
    pub removed: Vec<PathBuf>,
}

/// Filesystem operations used by the publisher
#[async_trait]
pub trait PublishFs: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Copy a directory tree into a new directory `to`, following symlinks.
    /// Returns the number of files copied.
    async fn copy_dir(&self, from: &Path, to: &Path) -> io::Result<u64>;

    async fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Entry names in a directory
    async fn list_names(&self, dir: &Path) -> io::Result<Vec<String>>;
}

/// Local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

#[async_trait]
impl PublishFs for LocalFs {
    async fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).await.is_ok()
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path).await
    }

    async fn copy_dir(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let mut copied = 0;
        // Each pending directory carries the resolved paths of its ancestors
        let mut pending = vec![(from.to_path_buf(), to.to_path_buf(), Vec::new())];

        while let Some((src, dst, mut ancestors)) = pending.pop() {
            let resolved = fs::canonicalize(&src).await?;
            if ancestors.contains(&resolved) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("symlink cycle at {}", src.display()),
                ));
            }
            ancestors.push(resolved);

            fs::create_dir(&dst).await?;

            let mut entries = fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let target = dst.join(entry.file_name());

                // Links may point outside the build output, so publish what they point at
                let mut file_type = entry.file_type().await?;
                if file_type.is_symlink() {
                    file_type = fs::metadata(&path)
                        .await
                        .map_err(|e| {
                            io::Error::new(
                                e.kind(),
                                format!("unresolvable symlink {}: {}", path.display(), e),
                            )
                        })?
                        .file_type();
                }

                if file_type.is_dir() {
                    pending.push((path, target, ancestors.clone()));
                } else {
                    fs::copy(&path, &target).await?;
                    copied += 1;
                }
            }
        }

        Ok(copied)
    }

    async fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path).await?.modified()
    }

    async fn list_names(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

/// Publishes build output into one shared serving location.
///
/// This is the only writer of the serving location.
#[derive(Clone)]
pub struct ArtifactPublisher {
    serving: PathBuf,
    fs: Arc<dyn PublishFs>,
}

impl ArtifactPublisher {
    pub fn new(serving: impl Into<PathBuf>) -> Self {
        Self::with_fs(serving, Arc::new(LocalFs))
    }

    pub fn with_fs(serving: impl Into<PathBuf>, fs: Arc<dyn PublishFs>) -> Self {
        Self {
            serving: serving.into(),
            fs,
        }
    }

    pub fn serving_location(&self) -> &Path {
        &self.serving
    }

    pub fn staging_path(&self, deployment_id: &str) -> PathBuf {
        self.sibling("staging", deployment_id)
    }

    pub fn previous_path(&self, deployment_id: &str) -> PathBuf {
        self.sibling("previous", deployment_id)
    }

    /// Publish the tree at `source` as the new serving tree
    pub async fn publish(
        &self,
        source: &Path,
        deployment_id: &str,
    ) -> Result<PublishReport, PublishError> {
        let staging = self.staging_path(deployment_id);
        let previous = self.previous_path(deployment_id);

        // 1. Stage next to the serving location so the renames stay on one volume
        if self.fs.exists(&staging).await {
            self.discard(&staging).await;
        }
        let files = match self.fs.copy_dir(source, &staging).await {
            Ok(files) => files,
            Err(e) => {
                self.discard(&staging).await;
                return Err(PublishError::Staging(e));
            }
        };
        debug!("Staged {} files at {}", files, staging.display());

        // 2. Move the live tree aside
        let had_live_tree = self.fs.exists(&self.serving).await;
        if had_live_tree {
            if let Err(e) = self.fs.rename(&self.serving, &previous).await {
                self.discard(&staging).await;
                return Err(PublishError::MoveAside(e));
            }
        }

        // 3. Swap the new tree in, rolling back on failure
        if let Err(cause) = self.fs.rename(&staging, &self.serving).await {
            if !had_live_tree {
                self.discard(&staging).await;
                return Err(PublishError::Failed { cause });
            }

            return match self.fs.rename(&previous, &self.serving).await {
                Ok(()) => {
                    warn!(
                        "Publish of {} failed, restored previous tree: {}",
                        deployment_id, cause
                    );
                    self.discard(&staging).await;
                    Err(PublishError::Failed { cause })
                }
                Err(rollback) => {
                    error!(
                        "Publish of {} failed and rollback failed; {} needs operator attention \
                         (previous tree left at {}, new tree at {}): {}; rollback: {}",
                        deployment_id,
                        self.serving.display(),
                        previous.display(),
                        staging.display(),
                        cause,
                        rollback
                    );
                    Err(PublishError::Unrecoverable { cause, rollback })
                }
            };
        }

        // 4. Drop the previous tree
        let mut warnings = Vec::new();
        if had_live_tree {
            if let Err(e) = self.fs.remove_dir_all(&previous).await {
                let warning = format!(
                    "failed to remove previous tree {}: {}",
                    previous.display(),
                    e
                );
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        info!(
            "Published {} ({} files) to {}",
            deployment_id,
            files,
            self.serving.display()
        );

        Ok(PublishReport {
            serving: self.serving.clone(),
            files,
            warnings,
        })
    }

    /// Repair the serving location after a crash mid-publish.
    ///
    /// If the serving location is missing, the newest previous tree is moved
    /// back. Remaining staging and previous trees are deleted.
    pub async fn recover(&self) -> io::Result<RecoveryReport> {
        let parent = self.parent_dir();
        let name = self.serving_name();
        let previous_prefix = format!(".{}.previous-", name);
        let staging_prefix = format!(".{}.staging-", name);

        let mut previous = Vec::new();
        let mut staging = Vec::new();
        for entry in self.fs.list_names(&parent).await? {
            if entry.starts_with(&previous_prefix) {
                previous.push(entry);
            } else if entry.starts_with(&staging_prefix) {
                staging.push(entry);
            }
        }
        let mut previous = self.oldest_first(&parent, previous).await;

        let mut report = RecoveryReport::default();

        if !self.fs.exists(&self.serving).await {
            if let Some(latest) = previous.pop() {
                let latest = parent.join(latest);
                warn!(
                    "Serving location {} is missing, restoring {}",
                    self.serving.display(),
                    latest.display()
                );
                self.fs.rename(&latest, &self.serving).await?;
                report.restored = Some(latest);
            }
        }

        for leftover in previous.into_iter().chain(staging) {
            let path = parent.join(leftover);
            match self.fs.remove_dir_all(&path).await {
                Ok(()) => {
                    info!("Removed leftover publish tree {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        Ok(report)
    }

    /// Order previous trees by the timestamp in their deployment id, then by
    /// modification time, since ids only carry whole seconds.
    async fn oldest_first(&self, parent: &Path, names: Vec<String>) -> Vec<String> {
        let mut keyed = Vec::with_capacity(names.len());
        for name in names {
            let stamp = name
                .rsplit_once(".previous-")
                .map(|(_, id)| id.split('-').next().unwrap_or_default().to_string())
                .unwrap_or_default();
            let modified = self
                .fs
                .modified(&parent.join(&name))
                .await
                .unwrap_or(SystemTime::UNIX_EPOCH);
            keyed.push((stamp, modified, name));
        }
        keyed.sort();
        keyed.into_iter().map(|(_, _, name)| name).collect()
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = self.fs.remove_dir_all(path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    fn sibling(&self, kind: &str, deployment_id: &str) -> PathBuf {
        self.parent_dir()
            .join(format!(".{}.{}-{}", self.serving_name(), kind, deployment_id))
    }

    fn parent_dir(&self) -> PathBuf {
        match self.serving.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn serving_name(&self) -> String {
        self.serving
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "serving".to_string())
    }
}
