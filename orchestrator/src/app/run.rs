//! Daemon run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::OrchestratorError;
use crate::server::serve::serve;
use crate::server::state::ServerState;

/// Run the orchestrator daemon until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OrchestratorError> {
    info!("Initializing shipyard...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let app_state = match init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start shipyard: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    let unsettled = app_state
        .controller
        .shutdown(options.lifecycle.max_shutdown_delay)
        .await;
    if unsettled > 0 {
        warn!(
            "{} deployments still in progress; they will be reconciled on next start",
            unsettled
        );
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, OrchestratorError> {
    let app_state = Arc::new(AppState::init(&options.layout, &options.settings).await?);
    info!(
        "Loaded {} registered services",
        app_state.registry.list().await.len()
    );

    app_state.controller.recover().await?;

    init_api_server(
        options,
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    Ok(app_state)
}

async fn init_api_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), OrchestratorError> {
    info!("Initializing HTTP API server...");

    let server_state = ServerState::new(
        app_state.controller.clone(),
        options.settings.api_token.clone(),
    );
    if server_state.api_token.is_none() {
        warn!("No api_token configured; the API accepts unauthenticated requests");
    }

    let server_handle = serve(&options.settings.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_api_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    api_server_handle: Option<JoinHandle<Result<(), OrchestratorError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            api_server_handle: None,
        }
    }

    pub fn with_api_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), OrchestratorError>>,
    ) -> Result<(), OrchestratorError> {
        if self.api_server_handle.is_some() {
            return Err(OrchestratorError::ShutdownError(
                "api_server_handle already set".to_string(),
            ));
        }
        self.api_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), OrchestratorError> {
        info!("Shutting down shipyard...");

        if let Some(handle) = self.api_server_handle.take() {
            handle
                .await
                .map_err(|e| OrchestratorError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
