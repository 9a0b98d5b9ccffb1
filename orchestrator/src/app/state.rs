//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::attempts::AttemptBook;
use crate::deploy::controller::{ControllerOptions, DeploymentController};
use crate::errors::OrchestratorError;
use crate::registry::ServiceRegistry;
use crate::router::traefik::{TraefikFileRouter, TraefikOptions};
use crate::router::Router;
use crate::runtime::docker::{DockerOptions, DockerRuntime};
use crate::runtime::ContainerRuntime;
use crate::secrets::{FileSecretStore, SecretStore};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application state
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub attempts: Arc<AttemptBook>,
    pub controller: Arc<DeploymentController>,
}

impl AppState {
    /// Open durable state and wire the Docker and Traefik adapters
    pub async fn init(layout: &StorageLayout, settings: &Settings) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");

        let registry = Arc::new(ServiceRegistry::open(layout.registry_file()).await?);
        let attempts = Arc::new(
            AttemptBook::open(layout.attempts_file(), settings.controller.history_limit).await?,
        );

        let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(layout.secrets_dir()));
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(DockerOptions {
            binary: settings.docker.binary.clone(),
        })?);
        let router: Arc<dyn Router> = Arc::new(
            TraefikFileRouter::open(TraefikOptions {
                dynamic_dir: layout.routes_dir().path().to_path_buf(),
                api_url: settings.router.api_url.clone(),
                timeout: settings.router.timeout,
            })
            .await?,
        );

        if let Err(e) = router.ping().await {
            warn!("Router check failed: {}", e);
        }

        let controller = Arc::new(DeploymentController::new(
            registry.clone(),
            secrets,
            runtime,
            router,
            attempts.clone(),
            ControllerOptions::from(&settings.controller),
        ));

        Ok(Self {
            registry,
            attempts,
            controller,
        })
    }
}
