//! Supported frameworks

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Framework a repository is built with.
///
/// The set is closed: requests naming anything else are rejected before a
/// workspace is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    React,
    Vue,
    Svelte,
    Node,
    NodePrisma,
}

impl Framework {
    pub const ALL: [Framework; 5] = [
        Framework::React,
        Framework::Vue,
        Framework::Svelte,
        Framework::Node,
        Framework::NodePrisma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::React => "react",
            Framework::Vue => "vue",
            Framework::Svelte => "svelte",
            Framework::Node => "node",
            Framework::NodePrisma => "node-prisma",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Framework::ALL
            .into_iter()
            .find(|framework| framework.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Framework::ALL.iter().map(|f| f.as_str()).collect();
                DeployError::ValidationError(format!(
                    "unknown framework '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}
