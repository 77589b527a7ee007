//! Finite State Machine for the deployment lifecycle

use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Accepted, waiting for the gate
    Pending,

    /// Pipeline in progress
    Running,

    /// Published
    Success,

    /// Failed at a stage, at publish, or on an internal fault
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Gate acquired, pipeline starts
    Start,

    /// Every stage and the publish succeeded
    Succeed,

    /// Something failed
    Fail(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Pending,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (self.state, event) {
            (DeploymentStatus::Pending, DeploymentEvent::Start) => DeploymentStatus::Running,

            (DeploymentStatus::Running, DeploymentEvent::Succeed) => DeploymentStatus::Success,

            // A fault before the pipeline started still ends the deployment
            (DeploymentStatus::Pending | DeploymentStatus::Running, DeploymentEvent::Fail(err)) => {
                self.error = Some(err);
                DeploymentStatus::Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
