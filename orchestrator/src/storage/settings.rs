//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::utils::serde_duration;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files (defaults to `<base>/logs`)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory holding registry and attempt history (defaults to `<base>`)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Owner-only directory of `<service>.env` files (defaults to `<base>/secrets`)
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,

    /// HTTP API server
    #[serde(default)]
    pub server: ServerSettings,

    /// Bearer token required by the HTTP API
    #[serde(default, skip_serializing)]
    pub api_token: Option<SecretString>,

    /// Container engine
    #[serde(default)]
    pub docker: DockerSettings,

    /// Reverse proxy
    #[serde(default)]
    pub router: RouterSettings,

    /// Deployment controller timings
    #[serde(default)]
    pub controller: ControllerSettings,

    /// Networks created by `init`
    #[serde(default = "default_networks")]
    pub networks: Vec<String>,
}

fn default_networks() -> Vec<String> {
    vec!["web".to_string(), "internal".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            state_dir: None,
            secrets_dir: None,
            server: ServerSettings::default(),
            api_token: None,
            docker: DockerSettings::default(),
            router: RouterSettings::default(),
            controller: ControllerSettings::default(),
            networks: default_networks(),
        }
    }
}

/// HTTP API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
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
    7700
}

impl ServerSettings {
    /// Base URL the CLI uses to reach this server
    pub fn url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Docker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Docker CLI binary
    #[serde(default = "default_docker_binary")]
    pub binary: String,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
        }
    }
}

/// Traefik settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Directory watched by the Traefik file provider (defaults to `<base>/routes`)
    #[serde(default)]
    pub dynamic_dir: Option<PathBuf>,

    /// Traefik API URL used for reachability checks
    #[serde(default)]
    pub api_url: Option<String>,

    /// Timeout for Traefik API calls
    #[serde(default = "default_router_timeout", with = "serde_duration")]
    pub timeout: Duration,
}

fn default_router_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            dynamic_dir: None,
            api_url: None,
            timeout: default_router_timeout(),
        }
    }
}

/// Deployment controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// How long a pending attempt waits for its dependencies
    #[serde(default = "default_dependency_timeout", with = "serde_duration")]
    pub dependency_timeout: Duration,

    /// Time the previous instance keeps serving in-flight requests after cutover
    #[serde(default = "default_drain_grace", with = "serde_duration")]
    pub drain_grace: Duration,

    /// Upper bound for a single router operation
    #[serde(default = "default_router_timeout", with = "serde_duration")]
    pub router_timeout: Duration,

    /// Attempts at removing the previous instance after commit
    #[serde(default = "default_removal_retries")]
    pub removal_retries: u32,

    /// Finished attempts kept per service
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_dependency_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_drain_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_removal_retries() -> u32 {
    5
}

fn default_history_limit() -> usize {
    20
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            dependency_timeout: default_dependency_timeout(),
            drain_grace: default_drain_grace(),
            router_timeout: default_router_timeout(),
            removal_retries: default_removal_retries(),
            history_limit: default_history_limit(),
        }
    }
}
