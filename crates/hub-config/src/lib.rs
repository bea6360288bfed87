use hub_core::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod discovery;

pub use discovery::{
    slugify, ConfigDiscovery, ConfigSource, Discovery, LaunchSpec, ProviderDefinition, SourceKind,
};

/// Gateway-wide settings, read from `gateway.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Name announced to the host; also excluded from discovery so the
    /// gateway never launches itself.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Namespace prefix for in-process tools. Empty keeps their names as-is.
    #[serde(default)]
    pub local_prefix: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Extra provider files, ranked after the project-local override.
    #[serde(default)]
    pub provider_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    #[serde(default = "default_local_call_ms")]
    pub local_call_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl TimeoutSettings {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn local_call(&self) -> Duration {
        Duration::from_millis(self.local_call_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Restart policy applied to remote providers that crash after becoming ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Maximum number of restart attempts per session
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first attempt, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the delay between attempts, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        let ms = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(u64::from(steps) + 1),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(steps).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Backoff strategy for restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
    Fixed,
}

impl GatewaySettings {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| HubError::ConfigParse {
            source_name: path.display().to_string(),
            message: format!("Failed to read settings file: {}", e),
        })?;

        Self::parse(&content, &path.display().to_string())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::parse(yaml, "<inline>")
    }

    fn parse(yaml: &str, source_name: &str) -> Result<Self> {
        let mut settings: GatewaySettings =
            serde_yaml::from_str(yaml).map_err(|e| HubError::ConfigParse {
                source_name: source_name.to_string(),
                message: format!("Failed to parse YAML: {}", e),
            })?;

        settings.expand_env_vars();
        settings.validate(source_name)?;

        Ok(settings)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(home_dir) = env::var("HOME_DIR") {
            self.paths.home_dir = PathBuf::from(home_dir);
        }
        if let Ok(workspace_dir) = env::var("WORKSPACE_DIR") {
            self.paths.workspace_dir = PathBuf::from(workspace_dir);
        }
    }

    fn validate(&self, source_name: &str) -> Result<()> {
        let invalid = |message: &str| HubError::ConfigParse {
            source_name: source_name.to_string(),
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("Gateway name cannot be empty"));
        }
        let t = &self.timeouts;
        if t.handshake_ms == 0 || t.call_ms == 0 || t.local_call_ms == 0 {
            return Err(invalid("Timeouts must be greater than zero"));
        }
        if self.restart_policy.initial_delay_ms > self.restart_policy.max_delay_ms {
            return Err(invalid("restart_policy.initial_delay_ms exceeds max_delay_ms"));
        }
        Ok(())
    }

    /// Names never launched as providers: the configured exclusions plus the
    /// gateway itself.
    pub fn excluded_names(&self) -> Vec<String> {
        let mut names = self.exclude.clone();
        if !names.iter().any(|n| n == &self.name) {
            names.push(self.name.clone());
        }
        names
    }

    pub fn default_config_path() -> PathBuf {
        default_home_dir().join(".mcp-hub").join("gateway.yaml")
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            paths: PathSettings::default(),
            timeouts: TimeoutSettings::default(),
            restart_policy: RestartPolicy::default(),
            local_prefix: String::new(),
            exclude: Vec::new(),
            provider_files: Vec::new(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            call_ms: default_call_ms(),
            local_call_ms: default_local_call_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::Exponential,
        }
    }
}

fn default_name() -> String { "mcp-hub".to_string() }
fn default_handshake_ms() -> u64 { 10_000 }
fn default_call_ms() -> u64 { 30_000 }
fn default_local_call_ms() -> u64 { 30_000 }
fn default_shutdown_grace_ms() -> u64 { 5_000 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }

fn default_home_dir() -> PathBuf {
    env::var("HOME_DIR")
        .unwrap_or_else(|_| env::var("HOME").unwrap_or_else(|_| ".".to_string()))
        .into()
}

fn default_workspace_dir() -> PathBuf {
    env::var("WORKSPACE_DIR")
        .unwrap_or_else(|_| ".".to_string())
        .into()
}
