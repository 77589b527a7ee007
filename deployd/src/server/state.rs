//! Server state

use std::sync::Arc;

use crate::cache::deployments::DeploymentHistory;
use crate::deploy::engine::PipelineEngine;
use crate::server::auth::ApiKey;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Arc<PipelineEngine>,
    /// Requests are not authenticated when unset
    pub api_key: Option<ApiKey>,
}

impl ServerState {
    pub fn new(engine: Arc<PipelineEngine>, api_key: Option<ApiKey>) -> Self {
        Self { engine, api_key }
    }

    pub fn history(&self) -> &Arc<DeploymentHistory> {
        self.engine.history()
    }
}
