//! Deployment models

use chrono::{DateTime, Utc};
use openapi_server::models::DeploymentRecord;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use crate::errors::DeployError;
use crate::models::framework::Framework;

/// Why a deployment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A pipeline stage failed or timed out
    Stage,

    /// Publishing failed and the previous tree is still being served
    Publish,

    /// Publishing failed and the rollback failed too
    PublishUnrecoverable,

    /// Unexpected fault inside the pipeline
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Stage => "stage",
            FailureKind::Publish => "publish",
            FailureKind::PublishUnrecoverable => "publish_unrecoverable",
            FailureKind::Internal => "internal",
        }
    }
}

/// Captured stage output, kept in execution order.
///
/// Entries are append-only: a stage name can be recorded once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutputs {
    entries: Vec<(String, String)>,
}

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the output of a stage. Returns false if the stage already has an entry.
    pub fn record(&mut self, stage: &str, output: String) -> bool {
        if self.get(stage).is_some() {
            warn!("Ignoring duplicate output for stage {}", stage);
            return false;
        }
        self.entries.push((stage.to_string(), output));
        true
    }

    pub fn get(&self, stage: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, output)| output.as_str())
    }

    /// Stage names in execution order
    pub fn stages(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, output)| (name.as_str(), output.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One build-and-publish attempt
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Unique deployment ID, also the workspace directory name
    pub id: String,

    /// Repository to clone
    pub repo_url: String,

    /// Framework the repository is built with
    pub framework: Framework,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    fsm: DeploymentFsm,
    stage_outputs: StageOutputs,
    deploy_path: Option<String>,
    failure_kind: Option<FailureKind>,
}

impl Deployment {
    pub fn new(id: String, repo_url: String, framework: Framework) -> Self {
        Self {
            id,
            repo_url,
            framework,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            fsm: DeploymentFsm::new(),
            stage_outputs: StageOutputs::new(),
            deploy_path: None,
            failure_kind: None,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        self.fsm.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.fsm.state().is_terminal()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.fsm.error()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure_kind
    }

    pub fn deploy_path(&self) -> Option<&str> {
        self.deploy_path.as_deref()
    }

    pub fn stage_outputs(&self) -> &StageOutputs {
        &self.stage_outputs
    }

    /// Output sink for the running pipeline
    pub fn stage_outputs_mut(&mut self) -> &mut StageOutputs {
        &mut self.stage_outputs
    }

    pub fn mark_running(&mut self) -> Result<(), DeployError> {
        self.transition(DeploymentEvent::Start)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_succeeded(&mut self, deploy_path: String) -> Result<(), DeployError> {
        self.transition(DeploymentEvent::Succeed)?;
        self.deploy_path = Some(deploy_path);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, kind: FailureKind, message: String) -> Result<(), DeployError> {
        self.transition(DeploymentEvent::Fail(message))?;
        self.failure_kind = Some(kind);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, event: DeploymentEvent) -> Result<(), DeployError> {
        self.fsm
            .process(event)
            .map_err(|e| DeployError::Internal(format!("deployment {}: {}", self.id, e)))
    }

    /// Wire representation
    pub fn to_record(&self) -> DeploymentRecord {
        let stage_outputs = self
            .stage_outputs
            .iter()
            .map(|(name, output)| (name.to_string(), serde_json::Value::String(output.to_string())))
            .collect();

        DeploymentRecord {
            id: self.id.clone(),
            status: self.status().as_str().to_string(),
            repo_url: self.repo_url.clone(),
            framework: self.framework.as_str().to_string(),
            deploy_path: self.deploy_path.clone(),
            error_message: self.error_message().map(str::to_string),
            failure_kind: self.failure_kind.map(|k| k.as_str().to_string()),
            stage_outputs,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Validate a repository URL: an absolute http(s) URL with a host.
pub fn validate_repo_url(raw: &str) -> Result<String, DeployError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DeployError::ValidationError(
            "repository URL is empty".to_string(),
        ));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(DeployError::ValidationError(format!(
            "repository URL contains whitespace: {}",
            trimmed
        )));
    }

    let url = Url::parse(trimmed).map_err(|e| {
        DeployError::ValidationError(format!("invalid repository URL {}: {}", trimmed, e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeployError::ValidationError(format!(
            "unsupported repository URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(DeployError::ValidationError(format!(
            "repository URL has no host: {}",
            trimmed
        )));
    }

    Ok(trimmed.to_string())
}
