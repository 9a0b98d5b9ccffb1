//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::OrchestratorError;
use crate::server::handlers::{
    apply_services_handler, deploy_handler, get_deployment_handler, get_service_handler,
    health_handler, list_deployments_handler, list_services_handler, remove_service_handler,
    require_token, rollback_handler, status_handler, version_handler,
};
use crate::server::state::ServerState;
use crate::storage::settings::ServerSettings;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/version", get(version_handler))
        // Services
        .route(
            "/services",
            get(list_services_handler)
                .post(apply_services_handler)
                .put(apply_services_handler),
        )
        .route(
            "/services/{name}",
            get(get_service_handler).delete(remove_service_handler),
        )
        .route("/services/{name}/rollback", post(rollback_handler))
        // Deployments
        .route(
            "/deployments",
            get(list_deployments_handler).post(deploy_handler),
        )
        .route("/deployments/{id}", get(get_deployment_handler))
        .route("/status", get(status_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    settings: &ServerSettings,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), OrchestratorError>>, OrchestratorError> {
    let app = router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::ServerError(format!("{addr}: {e}")))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| OrchestratorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
