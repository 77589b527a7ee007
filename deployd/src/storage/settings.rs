//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::deploy::engine::PipelineOptions;
use crate::deploy::hooks::HookSettings;
use crate::deploy::stages::CommandTemplate;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Environment variable that overrides the configured API key
pub const API_KEY_ENV: &str = "DEPLOY_API_KEY";

/// Service settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the logs directory
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Key required in the `X-API-Key` header. Unset disables the check.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,

    /// Number of deployments kept in memory
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Build pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    50
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()).map(SecretString::from))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            server: ServerSettings::default(),
            api_key: None,
            history_capacity: default_history_capacity(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub async fn load(file: &File) -> anyhow::Result<Self> {
        if !file.exists().await {
            info!(
                "No settings file at {}, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }

        file.read_json::<Settings>()
            .await
            .with_context(|| format!("failed to read settings from {}", file.path().display()))
    }

    /// Apply overrides from the environment
    pub fn apply_env(&mut self) {
        self.apply_api_key_override(std::env::var(API_KEY_ENV).ok());
    }

    fn apply_api_key_override(&mut self, value: Option<String>) {
        if let Some(key) = value.filter(|v| !v.is_empty()) {
            self.api_key = Some(SecretString::from(key));
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Build pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_git_program")]
    pub git_program: String,

    /// Runs `install` and `run build`
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Per command of a framework hook
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,

    /// Build output directory, relative to the repository root
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Address reported for successful deployments
    #[serde(default = "default_public_path")]
    pub public_path: String,
}

fn default_git_program() -> String {
    "git".to_string()
}

fn default_package_manager() -> String {
    "npm".to_string()
}

fn default_clone_timeout() -> u64 {
    300
}

fn default_build_timeout() -> u64 {
    600
}

fn default_hook_timeout() -> u64 {
    120
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_public_path() -> String {
    "/".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            git_program: default_git_program(),
            package_manager: default_package_manager(),
            clone_timeout_secs: default_clone_timeout(),
            install_timeout_secs: default_build_timeout(),
            build_timeout_secs: default_build_timeout(),
            hook_timeout_secs: default_hook_timeout(),
            output_dir: default_output_dir(),
            public_path: default_public_path(),
        }
    }
}

impl PipelineSettings {
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            clone: CommandTemplate::new(
                &self.git_program,
                ["clone", "{repo_url}", "{workspace}"],
                Duration::from_secs(self.clone_timeout_secs),
            )
            .outside_workspace(),
            install: CommandTemplate::new(
                &self.package_manager,
                ["install"],
                Duration::from_secs(self.install_timeout_secs),
            ),
            build: CommandTemplate::new(
                &self.package_manager,
                ["run", "build"],
                Duration::from_secs(self.build_timeout_secs),
            ),
            output_dir: self.output_dir.clone(),
            public_path: self.public_path.clone(),
            hooks: HookSettings {
                command_timeout: Duration::from_secs(self.hook_timeout_secs),
            },
            ..PipelineOptions::default()
        }
    }
}
