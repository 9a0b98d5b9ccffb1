//! Application configuration options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Loaded settings file
    pub settings: Settings,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,
}

impl AppOptions {
    pub fn new(layout: StorageLayout, settings: Settings) -> Self {
        Self {
            layout: layout.with_settings(&settings),
            settings,
            lifecycle: LifecycleOptions::default(),
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
