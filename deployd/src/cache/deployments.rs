//! Recent deployment history

use std::collections::VecDeque;
use std::sync::RwLock;

use tracing::debug;

use crate::models::deployment::Deployment;

/// In-memory store of recent deployments, newest first.
///
/// Holds at most `capacity` records. When full, the oldest finished record
/// is evicted first.
pub struct DeploymentHistory {
    entries: RwLock<VecDeque<Deployment>>,
    capacity: usize,
}

impl DeploymentHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert a deployment or replace the stored snapshot with the same id
    pub fn upsert(&self, deployment: &Deployment) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = entries.iter_mut().find(|d| d.id == deployment.id) {
            *existing = deployment.clone();
            return;
        }

        if entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .rposition(Deployment::is_terminal)
                .unwrap_or(entries.len() - 1);
            if let Some(evicted) = entries.remove(victim) {
                debug!("Evicted deployment {} from history", evicted.id);
            }
        }

        entries.push_front(deployment.clone());
    }

    pub fn get(&self, id: &str) -> Option<Deployment> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().find(|d| d.id == id).cloned()
    }

    /// All stored deployments, newest first
    pub fn list(&self) -> Vec<Deployment> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
