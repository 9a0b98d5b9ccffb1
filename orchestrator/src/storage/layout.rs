//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::settings::Settings;

/// On-disk layout of the orchestrator
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory holding `settings.json`
    pub base_dir: PathBuf,

    state_dir: Option<PathBuf>,
    secrets_dir: Option<PathBuf>,
    routes_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl StorageLayout {
    /// Create a new storage layout rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state_dir: None,
            secrets_dir: None,
            routes_dir: None,
            log_dir: None,
        }
    }

    /// Apply the directory overrides from `settings`
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.state_dir = settings.state_dir.clone();
        self.secrets_dir = settings.secrets_dir.clone();
        self.routes_dir = settings.router.dynamic_dir.clone();
        self.log_dir = settings.log_dir.clone();
        self
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the state directory
    pub fn state_dir(&self) -> Dir {
        Dir::new(self.state_dir.clone().unwrap_or_else(|| self.base_dir.clone()))
    }

    /// Get the registry file path
    pub fn registry_file(&self) -> File {
        self.state_dir().file("registry.json")
    }

    /// Get the attempt history file path
    pub fn attempts_file(&self) -> File {
        self.state_dir().file("attempts.json")
    }

    /// Get the secrets directory
    pub fn secrets_dir(&self) -> Dir {
        Dir::new(
            self.secrets_dir
                .clone()
                .unwrap_or_else(|| self.base_dir.join("secrets")),
        )
    }

    /// Get the Traefik dynamic config directory
    pub fn routes_dir(&self) -> Dir {
        Dir::new(
            self.routes_dir
                .clone()
                .unwrap_or_else(|| self.base_dir.join("routes")),
        )
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.log_dir.clone().unwrap_or_else(|| self.base_dir.join("logs")))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/shipyard");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shipyard");

        Self::new(base_dir)
    }
}
