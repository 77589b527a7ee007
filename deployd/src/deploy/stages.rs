//! Ordered pipeline stages

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::deploy::runner::{CommandOutcome, CommandOutput, CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::models::deployment::StageOutputs;
use crate::models::framework::Framework;

/// What a stage can see of the running deployment
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub deployment_id: String,
    pub repo_url: String,
    pub framework: Framework,
    pub workspace: PathBuf,
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailureReason {
    /// The external command exited non-zero or timed out
    Command(CommandOutcome),

    /// A required file or directory is missing
    Precondition(String),
}

impl fmt::Display for StageFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailureReason::Command(outcome) => write!(f, "{}", outcome),
            StageFailureReason::Precondition(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,

    /// Nothing to do; the stage leaves no output entry
    Skipped,

    Failed(StageFailureReason),
}

/// Output and outcome of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub output: String,
    pub outcome: StageOutcome,
}

impl StageReport {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            outcome: StageOutcome::Succeeded,
        }
    }

    pub fn skipped() -> Self {
        Self {
            output: String::new(),
            outcome: StageOutcome::Skipped,
        }
    }

    pub fn failed(output: impl Into<String>, reason: StageFailureReason) -> Self {
        Self {
            output: output.into(),
            outcome: StageOutcome::Failed(reason),
        }
    }
}

impl From<CommandOutput> for StageReport {
    fn from(result: CommandOutput) -> Self {
        if result.outcome.is_success() {
            StageReport::succeeded(result.output)
        } else {
            StageReport::failed(result.output, StageFailureReason::Command(result.outcome))
        }
    }
}

/// Work done by one stage
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(&self, ctx: &PipelineContext) -> StageReport;
}

/// A named stage
#[derive(Clone)]
pub struct Stage {
    name: String,
    action: Arc<dyn StageAction>,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Progress of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    NotStarted,
    Running(usize),
    Succeeded,
    Failed(usize),
}

/// Result of running a sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    AllSucceeded,
    StageFailure {
        stage: String,
        reason: StageFailureReason,
    },
}

/// Stages run in order, stopping at the first failure.
pub struct StageSequence {
    stages: Vec<Stage>,
    state: SequenceState,
}

impl StageSequence {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            state: SequenceState::NotStarted,
        }
    }

    pub fn with_stage(mut self, name: impl Into<String>, action: Arc<dyn StageAction>) -> Self {
        self.stages.push(Stage::new(name, action));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Run every stage once, recording outputs as they complete.
    ///
    /// A sequence can only be run once.
    pub async fn run(
        &mut self,
        ctx: &PipelineContext,
        outputs: &mut StageOutputs,
    ) -> Result<SequenceOutcome, DeployError> {
        if self.state != SequenceState::NotStarted {
            return Err(DeployError::Internal(format!(
                "stage sequence for {} already ran ({:?})",
                ctx.deployment_id, self.state
            )));
        }

        for (index, stage) in self.stages.iter().enumerate() {
            self.state = SequenceState::Running(index);
            info!("[{}] stage {} started", ctx.deployment_id, stage.name);

            let report = stage.action.run(ctx).await;

            match report.outcome {
                StageOutcome::Succeeded => {
                    outputs.record(&stage.name, report.output);
                    info!("[{}] stage {} succeeded", ctx.deployment_id, stage.name);
                }
                StageOutcome::Skipped => {
                    debug!("[{}] stage {} skipped", ctx.deployment_id, stage.name);
                }
                StageOutcome::Failed(reason) => {
                    outputs.record(&stage.name, report.output);
                    warn!(
                        "[{}] stage {} failed: {}",
                        ctx.deployment_id, stage.name, reason
                    );
                    self.state = SequenceState::Failed(index);
                    return Ok(SequenceOutcome::StageFailure {
                        stage: stage.name.clone(),
                        reason,
                    });
                }
            }
        }

        self.state = SequenceState::Succeeded;
        Ok(SequenceOutcome::AllSucceeded)
    }
}

impl Default for StageSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A configurable command line.
///
/// Arguments may reference `{repo_url}`, `{workspace}` and `{deployment_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Run inside the workspace instead of the service's working directory
    pub in_workspace: bool,
}

impl CommandTemplate {
    pub fn new<I, S>(program: &str, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
            in_workspace: true,
        }
    }

    pub fn outside_workspace(mut self) -> Self {
        self.in_workspace = false;
        self
    }

    pub fn render(&self, ctx: &PipelineContext) -> CommandSpec {
        let workspace = ctx.workspace.to_string_lossy();
        let args = self.args.iter().map(|arg| {
            arg.replace("{repo_url}", &ctx.repo_url)
                .replace("{workspace}", &workspace)
                .replace("{deployment_id}", &ctx.deployment_id)
        });

        let spec = CommandSpec::new(self.program.clone(), self.timeout).args(args);
        if self.in_workspace {
            spec.current_dir(ctx.workspace.clone())
        } else {
            spec
        }
    }
}

/// Runs one command, optionally requiring a file to exist first
pub struct CommandStage {
    runner: Arc<dyn CommandRunner>,
    template: CommandTemplate,
    requires: Option<PathBuf>,
}

impl CommandStage {
    pub fn new(runner: Arc<dyn CommandRunner>, template: CommandTemplate) -> Self {
        Self {
            runner,
            template,
            requires: None,
        }
    }

    /// Fail without running the command unless `path` exists in the workspace
    pub fn requiring(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires = Some(path.into());
        self
    }
}

#[async_trait]
impl StageAction for CommandStage {
    async fn run(&self, ctx: &PipelineContext) -> StageReport {
        if let Some(required) = &self.requires {
            if fs::metadata(ctx.workspace.join(required)).await.is_err() {
                let message = format!("{} not found", required.display());
                return StageReport::failed(
                    format!("{}\n", message),
                    StageFailureReason::Precondition(message),
                );
            }
        }

        let spec = self.template.render(ctx);
        self.runner.run(&spec).await.into()
    }
}

/// Checks that the build produced its output directory
pub struct VerifyStage {
    output_dir: PathBuf,
}

impl VerifyStage {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl StageAction for VerifyStage {
    async fn run(&self, ctx: &PipelineContext) -> StageReport {
        let path = ctx.workspace.join(&self.output_dir);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => StageReport::succeeded(format!(
                "build output found at {}\n",
                self.output_dir.display()
            )),
            Ok(_) => {
                let message = format!("build output {} is not a directory", self.output_dir.display());
                StageReport::failed(
                    format!("{}\n", message),
                    StageFailureReason::Precondition(message),
                )
            }
            Err(_) => {
                let message = format!("build output {} not found", self.output_dir.display());
                StageReport::failed(
                    format!("{}\n", message),
                    StageFailureReason::Precondition(message),
                )
            }
        }
    }
}
