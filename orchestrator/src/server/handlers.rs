//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::errors::{ErrorKind, OrchestratorError};
use crate::models::attempt::DeploymentAttempt;
use crate::models::service::ServiceDeclarations;
use crate::models::status::ServiceStatus;
use crate::registry::RegistryEntry;
use crate::server::error::{ApiError, ErrorBody};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "shipyard".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Reject requests without the configured bearer token
pub async fn require_token(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if token_matches(presented, expected.expose_secret()) {
        return next.run(req).await;
    }

    let body = ErrorBody {
        kind: ErrorKind::PermissionDenied,
        message: "missing or invalid API token".to_string(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    match presented {
        Some(token) => token.as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

// ------------------------------- services --------------------------------- //

pub async fn list_services_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<RegistryEntry>> {
    Json(state.registry.list().await)
}

/// Names registered by an apply
#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub registered: Vec<String>,
}

pub async fn apply_services_handler(
    State(state): State<Arc<ServerState>>,
    Json(decls): Json<ServiceDeclarations>,
) -> Result<Json<ApplyResponse>, ApiError> {
    if decls.services.is_empty() {
        return Err(OrchestratorError::InvalidSpec("no services declared".to_string()).into());
    }
    let registered = state.registry.register_all(decls.services).await?;
    Ok(Json(ApplyResponse { registered }))
}

pub async fn get_service_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<RegistryEntry>, ApiError> {
    Ok(Json(state.registry.get(&name).await?))
}

pub async fn remove_service_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<RegistryEntry>, ApiError> {
    Ok(Json(state.controller.remove_service(&name).await?))
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<DeploymentAttempt>, ApiError> {
    Ok(Json(state.controller.rollback(&name).await?))
}

// ------------------------------ deployments ------------------------------- //

/// CI trigger body
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployRequest {
    pub service: String,
    pub version: String,
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeploymentAttempt>), ApiError> {
    let attempt = state.controller.deploy(&req.service, &req.version).await?;
    Ok((StatusCode::ACCEPTED, Json(attempt)))
}

#[derive(Debug, Default, Deserialize)]
pub struct AttemptQuery {
    /// Block until the attempt is terminal
    #[serde(default)]
    pub wait: bool,
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<AttemptQuery>,
) -> Result<Json<DeploymentAttempt>, ApiError> {
    let attempt = if query.wait {
        state.controller.wait(&id).await?
    } else {
        state.controller.attempt(&id).await?
    };
    Ok(Json(attempt))
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceQuery {
    pub service: Option<String>,
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ServiceQuery>,
) -> Json<Vec<DeploymentAttempt>> {
    Json(state.controller.history(query.service.as_deref()).await)
}

pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceStatus>>, ApiError> {
    Ok(Json(state.controller.status(query.service.as_deref()).await?))
}
