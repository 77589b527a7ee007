//! Application state management

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cache::deployments::DeploymentHistory;
use crate::deploy::engine::PipelineEngine;
use crate::deploy::gate::DeploymentGate;
use crate::deploy::publisher::ArtifactPublisher;
use crate::deploy::runner::CommandRunner;
use crate::deploy::workspace::Workspaces;
use crate::errors::DeployError;
use crate::storage::layout::StorageLayout;

/// Main application state
pub struct AppState {
    /// Storage layout
    pub layout: StorageLayout,

    /// Recent deployments
    pub history: Arc<DeploymentHistory>,

    /// Deployment pipeline
    pub engine: Arc<PipelineEngine>,

    runner: Arc<dyn CommandRunner>,
}

impl AppState {
    /// Prepare storage, repair an interrupted publish, clear stale workspaces,
    /// and build the pipeline
    pub async fn init(
        options: &AppOptions,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, DeployError> {
        info!("Initializing application state...");

        let layout = options.storage.layout.clone();
        layout.setup().await?;

        let serving_dir = layout.serving_dir();
        let publisher = ArtifactPublisher::new(serving_dir.path());
        let recovery = publisher.recover().await?;
        if let Some(restored) = &recovery.restored {
            warn!(
                "Restored {} into {} after an interrupted publish",
                restored.display(),
                serving_dir.path().display()
            );
        }
        serving_dir.create().await?;

        let workspaces = Workspaces::new(layout.workspaces_dir().path());
        workspaces.sweep().await?;

        let history = Arc::new(DeploymentHistory::new(options.storage.history_capacity));

        let engine = Arc::new(PipelineEngine::new(
            options.pipeline.clone(),
            runner.clone(),
            DeploymentGate::new(),
            publisher,
            workspaces,
            history.clone(),
        ));

        Ok(Self {
            layout,
            history,
            engine,
            runner,
        })
    }

    pub fn serving_dir(&self) -> PathBuf {
        self.layout.serving_dir().path().to_path_buf()
    }

    /// Kill any command still running. Used when shutdown cannot wait any longer.
    pub fn abort_commands(&self) -> usize {
        self.runner.terminate_all()
    }

    /// Wait for the deployment in flight, if any, to finish
    pub async fn shutdown(&self) -> Result<(), DeployError> {
        info!("Shutting down application state...");
        let gate = self.engine.gate();
        if gate.is_busy() {
            info!("Waiting for the running deployment to finish...");
        }
        let permit = gate.acquire().await?;
        gate.release(permit);
        Ok(())
    }
}
