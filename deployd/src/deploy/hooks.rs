//! Framework-specific hooks run between clone and install

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::deploy::runner::CommandRunner;
use crate::deploy::stages::{
    CommandTemplate, PipelineContext, StageAction, StageFailureReason, StageReport,
};
use crate::models::framework::Framework;

/// Hook settings
#[derive(Debug, Clone)]
pub struct HookSettings {
    /// Timeout for each hook command
    pub command_timeout: Duration,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// An optional sub-pipeline, active only when its marker file exists in the clone
#[derive(Debug, Clone)]
pub struct FrameworkHook {
    name: &'static str,
    marker: PathBuf,
    commands: Vec<CommandTemplate>,
}

impl FrameworkHook {
    pub fn new(
        name: &'static str,
        marker: impl Into<PathBuf>,
        commands: Vec<CommandTemplate>,
    ) -> Self {
        Self {
            name,
            marker: marker.into(),
            commands,
        }
    }

    /// Prisma client generation and migrations
    pub fn prisma(settings: &HookSettings) -> Self {
        let timeout = settings.command_timeout;
        Self::new(
            "prisma",
            "prisma/schema.prisma",
            vec![
                CommandTemplate::new("npx", ["prisma", "generate"], timeout),
                CommandTemplate::new("npx", ["prisma", "migrate", "deploy"], timeout),
            ],
        )
    }

    /// Stage name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the hook's commands in order, stopping at the first failure
    pub async fn apply(&self, runner: &dyn CommandRunner, ctx: &PipelineContext) -> StageReport {
        if fs::metadata(ctx.workspace.join(&self.marker)).await.is_err() {
            debug!(
                "[{}] no {} in repository, {} hook not needed",
                ctx.deployment_id,
                self.marker.display(),
                self.name
            );
            return StageReport::skipped();
        }

        info!("[{}] running {} hook", ctx.deployment_id, self.name);

        let mut outputs: Vec<String> = Vec::with_capacity(self.commands.len());
        for template in &self.commands {
            let result = runner.run(&template.render(ctx)).await;
            outputs.push(result.output);
            if !result.outcome.is_success() {
                return StageReport::failed(
                    outputs.join("\n"),
                    StageFailureReason::Command(result.outcome),
                );
            }
        }

        StageReport::succeeded(outputs.join("\n"))
    }
}

impl Framework {
    /// The hook registered for this framework, if any
    pub fn hook(self, settings: &HookSettings) -> Option<FrameworkHook> {
        match self {
            Framework::NodePrisma => Some(FrameworkHook::prisma(settings)),
            Framework::React | Framework::Vue | Framework::Svelte | Framework::Node => None,
        }
    }
}

/// Adapts a hook to the stage interface
pub struct HookStage {
    hook: FrameworkHook,
    runner: Arc<dyn CommandRunner>,
}

impl HookStage {
    pub fn new(hook: FrameworkHook, runner: Arc<dyn CommandRunner>) -> Self {
        Self { hook, runner }
    }
}

#[async_trait]
impl StageAction for HookStage {
    async fn run(&self, ctx: &PipelineContext) -> StageReport {
        self.hook.apply(self.runner.as_ref(), ctx).await
    }
}
