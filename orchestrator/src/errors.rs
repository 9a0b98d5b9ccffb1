//! Error types for the shipyard orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service {service} is in use by: {}", .dependents.join(", "))]
    InUse {
        service: String,
        dependents: Vec<String>,
    },

    #[error("Secrets unavailable: {0}")]
    SecretsUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Insecure secret storage: {path} has mode {mode:o}, expected owner-only")]
    InsecureStorage { path: String, mode: u32 },

    #[error("Runtime error during {operation}: {cause}")]
    RuntimeError { operation: String, cause: String },

    #[error("Router unreachable: {0}")]
    RouterUnreachable(String),

    #[error("Rule conflict: host {host} is already routed to {owner}")]
    RuleConflict { host: String, owner: String },

    #[error("Timed out waiting for dependency {dependency} of {service}")]
    DependencyTimeout { service: String, dependency: String },

    #[error("A deployment of {0} is already in progress")]
    AttemptInProgress(String),

    #[error("Health check exhausted after {probes} probes: {last}")]
    HealthCheckExhausted { probes: u32, last: String },

    #[error("Cutover failed: {0}")]
    CutoverFailed(String),

    #[error("Deployment cancelled by operator")]
    Cancelled,

    #[error("Nothing to roll back: {0}")]
    NothingToRollBack(String),

    #[error("Deployment failed: {0}")]
    Failed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("API error ({kind}): {message}")]
    Api { kind: ErrorKind, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Shorthand for runtime adapter failures
    pub fn runtime(operation: impl Into<String>, cause: impl ToString) -> Self {
        OrchestratorError::RuntimeError {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Classify the error for exit codes and API responses
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::InUse { .. } => ErrorKind::InUse,
            OrchestratorError::SecretsUnavailable(_) => ErrorKind::SecretsUnavailable,
            OrchestratorError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            OrchestratorError::InsecureStorage { .. } => ErrorKind::InsecureStorage,
            OrchestratorError::RuntimeError { .. } => ErrorKind::RuntimeError,
            OrchestratorError::RouterUnreachable(_) => ErrorKind::RouterUnreachable,
            OrchestratorError::RuleConflict { .. } => ErrorKind::RuleConflict,
            OrchestratorError::DependencyTimeout { .. } => ErrorKind::DependencyTimeout,
            OrchestratorError::AttemptInProgress(_) => ErrorKind::AttemptInProgress,
            OrchestratorError::HealthCheckExhausted { .. } => ErrorKind::HealthCheckExhausted,
            OrchestratorError::CutoverFailed(_) => ErrorKind::CutoverFailed,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::NothingToRollBack(_) => ErrorKind::NothingToRollBack,
            OrchestratorError::Failed(_) => ErrorKind::Failed,
            OrchestratorError::HttpError(_) => ErrorKind::ApiUnreachable,
            OrchestratorError::Api { kind, .. } => *kind,
            OrchestratorError::IoError(_)
            | OrchestratorError::JsonError(_)
            | OrchestratorError::YamlError(_)
            | OrchestratorError::ConfigError(_)
            | OrchestratorError::ServerError(_)
            | OrchestratorError::ShutdownError(_)
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

/// Serializable error classification.
///
/// Carried in attempt records and API error bodies so the CLI can map a
/// remote failure to the same exit code as a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSpec,
    NotFound,
    InUse,
    SecretsUnavailable,
    PermissionDenied,
    InsecureStorage,
    RuntimeError,
    RouterUnreachable,
    RuleConflict,
    DependencyTimeout,
    AttemptInProgress,
    HealthCheckExhausted,
    CutoverFailed,
    Cancelled,
    NothingToRollBack,
    Failed,
    ApiUnreachable,
    Internal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::ApiUnreachable => 2,
            ErrorKind::InvalidSpec => 10,
            ErrorKind::NotFound => 11,
            ErrorKind::InUse => 12,
            ErrorKind::SecretsUnavailable => 20,
            ErrorKind::PermissionDenied => 21,
            ErrorKind::InsecureStorage => 22,
            ErrorKind::RuntimeError => 30,
            ErrorKind::RouterUnreachable => 40,
            ErrorKind::RuleConflict => 41,
            ErrorKind::DependencyTimeout => 50,
            ErrorKind::AttemptInProgress => 51,
            ErrorKind::HealthCheckExhausted => 52,
            ErrorKind::CutoverFailed => 53,
            ErrorKind::Cancelled => 54,
            ErrorKind::NothingToRollBack => 55,
            ErrorKind::Failed => 60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InUse => "in_use",
            ErrorKind::SecretsUnavailable => "secrets_unavailable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::InsecureStorage => "insecure_storage",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::RouterUnreachable => "router_unreachable",
            ErrorKind::RuleConflict => "rule_conflict",
            ErrorKind::DependencyTimeout => "dependency_timeout",
            ErrorKind::AttemptInProgress => "attempt_in_progress",
            ErrorKind::HealthCheckExhausted => "health_check_exhausted",
            ErrorKind::CutoverFailed => "cutover_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NothingToRollBack => "nothing_to_roll_back",
            ErrorKind::Failed => "failed",
            ErrorKind::ApiUnreachable => "api_unreachable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
