//! Deployment pipeline engine
//!
//! Turns a deploy request into a finished [`Deployment`]: validate, take the
//! gate, run the stages in a fresh workspace, publish, then release the gate
//! and reclaim the workspace whatever happened.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use openapi_server::models::DeployRequest;
use tracing::{error, info, warn};

use crate::cache::deployments::DeploymentHistory;
use crate::deploy::gate::DeploymentGate;
use crate::deploy::hooks::{HookSettings, HookStage};
use crate::deploy::publisher::ArtifactPublisher;
use crate::deploy::runner::CommandRunner;
use crate::deploy::stages::{
    CommandStage, CommandTemplate, PipelineContext, SequenceOutcome, StageSequence, VerifyStage,
};
use crate::deploy::workspace::Workspaces;
use crate::errors::DeployError;
use crate::models::deployment::{validate_repo_url, Deployment, FailureKind};
use crate::models::framework::Framework;
use crate::utils::generate_deployment_id;

pub const CLONE_STAGE: &str = "clone";
pub const INSTALL_STAGE: &str = "install";
pub const BUILD_STAGE: &str = "build";
pub const VERIFY_STAGE: &str = "verify";

/// Commands and paths used by the pipeline
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Runs outside the workspace; `{workspace}` is the clone target
    pub clone: CommandTemplate,

    pub install: CommandTemplate,

    /// Must exist in the clone before install runs
    pub install_requires: PathBuf,

    pub build: CommandTemplate,

    /// Build output directory, relative to the workspace
    pub output_dir: PathBuf,

    /// Address reported for a successful deployment
    pub public_path: String,

    pub hooks: HookSettings,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            clone: CommandTemplate::new(
                "git",
                ["clone", "{repo_url}", "{workspace}"],
                Duration::from_secs(300),
            )
            .outside_workspace(),
            install: CommandTemplate::new("npm", ["install"], Duration::from_secs(600)),
            install_requires: PathBuf::from("package.json"),
            build: CommandTemplate::new("npm", ["run", "build"], Duration::from_secs(600)),
            output_dir: PathBuf::from("dist"),
            public_path: "/".to_string(),
            hooks: HookSettings::default(),
        }
    }
}

/// Runs deployments one at a time
pub struct PipelineEngine {
    options: PipelineOptions,
    runner: Arc<dyn CommandRunner>,
    gate: DeploymentGate,
    publisher: ArtifactPublisher,
    workspaces: Workspaces,
    history: Arc<DeploymentHistory>,
}

impl PipelineEngine {
    pub fn new(
        options: PipelineOptions,
        runner: Arc<dyn CommandRunner>,
        gate: DeploymentGate,
        publisher: ArtifactPublisher,
        workspaces: Workspaces,
        history: Arc<DeploymentHistory>,
    ) -> Self {
        Self {
            options,
            runner,
            gate,
            publisher,
            workspaces,
            history,
        }
    }

    pub fn gate(&self) -> &DeploymentGate {
        &self.gate
    }

    pub fn history(&self) -> &Arc<DeploymentHistory> {
        &self.history
    }

    /// Validate a request into a pending deployment. No side effects.
    pub fn admit(&self, request: &DeployRequest) -> Result<Deployment, DeployError> {
        let repo_url = validate_repo_url(&request.repo_url)?;
        let framework: Framework = request.framework.trim().parse()?;
        Ok(Deployment::new(generate_deployment_id(), repo_url, framework))
    }

    /// Run a deployment to completion.
    ///
    /// Only validation errors are returned as `Err`. Every other failure is
    /// reported on the returned record.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<Deployment, DeployError> {
        let mut deployment = self.admit(request)?;
        self.history.upsert(&deployment);
        info!(
            "Deployment {} accepted: {} ({})",
            deployment.id, deployment.repo_url, deployment.framework
        );

        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                fail(
                    &mut deployment,
                    FailureKind::Internal,
                    format!("internal error: {}", e),
                );
                self.history.upsert(&deployment);
                return Ok(deployment);
            }
        };

        let result = AssertUnwindSafe(self.execute(&mut deployment))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => fail(
                &mut deployment,
                FailureKind::Internal,
                format!("internal error: {}", e),
            ),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Deployment {} panicked: {}", deployment.id, message);
                fail(
                    &mut deployment,
                    FailureKind::Internal,
                    format!("internal error: {}", message),
                );
            }
        }

        self.gate.release(permit);
        self.workspaces.reclaim(&deployment.id).await;
        self.history.upsert(&deployment);

        match deployment.error_message() {
            None => info!(
                "Deployment {} finished: {}",
                deployment.id,
                deployment.status().as_str()
            ),
            Some(message) => warn!(
                "Deployment {} finished: {}: {}",
                deployment.id,
                deployment.status().as_str(),
                message
            ),
        }

        Ok(deployment)
    }

    /// Stage sequence for a framework
    pub fn stages(&self, framework: Framework) -> StageSequence {
        let mut sequence = StageSequence::new().with_stage(
            CLONE_STAGE,
            Arc::new(CommandStage::new(
                self.runner.clone(),
                self.options.clone.clone(),
            )),
        );

        if let Some(hook) = framework.hook(&self.options.hooks) {
            let name = hook.name();
            let stage = HookStage::new(hook, self.runner.clone());
            sequence = sequence.with_stage(name, Arc::new(stage));
        }

        sequence
            .with_stage(
                INSTALL_STAGE,
                Arc::new(
                    CommandStage::new(self.runner.clone(), self.options.install.clone())
                        .requiring(self.options.install_requires.clone()),
                ),
            )
            .with_stage(
                BUILD_STAGE,
                Arc::new(CommandStage::new(
                    self.runner.clone(),
                    self.options.build.clone(),
                )),
            )
            .with_stage(
                VERIFY_STAGE,
                Arc::new(VerifyStage::new(self.options.output_dir.clone())),
            )
    }

    async fn execute(&self, deployment: &mut Deployment) -> Result<(), DeployError> {
        let workspace = self.workspaces.prepare(&deployment.id).await?;
        deployment.mark_running()?;
        self.history.upsert(deployment);

        let ctx = PipelineContext {
            deployment_id: deployment.id.clone(),
            repo_url: deployment.repo_url.clone(),
            framework: deployment.framework,
            workspace: workspace.clone(),
        };

        let mut sequence = self.stages(deployment.framework);
        info!(
            "[{}] running stages: {}",
            deployment.id,
            sequence.names().join(" -> ")
        );

        let outcome = sequence.run(&ctx, deployment.stage_outputs_mut()).await?;
        if let SequenceOutcome::StageFailure { stage, reason } = outcome {
            deployment.mark_failed(FailureKind::Stage, format!("{} failed: {}", stage, reason))?;
            return Ok(());
        }

        let output = workspace.join(&self.options.output_dir);
        match self.publisher.publish(&output, &deployment.id).await {
            Ok(_) => deployment.mark_succeeded(self.options.public_path.clone())?,
            Err(e) => {
                let kind = if e.is_unrecoverable() {
                    FailureKind::PublishUnrecoverable
                } else {
                    FailureKind::Publish
                };
                deployment.mark_failed(kind, format!("publish failed: {}", e))?;
            }
        }

        Ok(())
    }
}

fn fail(deployment: &mut Deployment, kind: FailureKind, message: String) {
    if let Err(e) = deployment.mark_failed(kind, message) {
        error!("Unable to mark deployment failed: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "pipeline panicked".to_string()
    }
}
