//! Single-flight deployment gate

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::errors::DeployError;

/// Admits one deployment pipeline at a time.
///
/// Clones share the same permit. Waiters are woken in the order they queued.
#[derive(Debug, Clone)]
pub struct DeploymentGate {
    permits: Arc<Semaphore>,
}

/// Held while a pipeline runs; dropping it releases the gate
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl DeploymentGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until no other pipeline holds the gate
    pub async fn acquire(&self) -> Result<GatePermit, DeployError> {
        debug!("Waiting for deployment gate");
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DeployError::Internal(format!("deployment gate closed: {}", e)))?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    pub fn release(&self, permit: GatePermit) {
        drop(permit);
        debug!("Deployment gate released");
    }

    /// Whether a pipeline currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for DeploymentGate {
    fn default() -> Self {
        Self::new()
    }
}
