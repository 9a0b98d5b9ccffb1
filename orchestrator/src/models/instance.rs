//! Running instance and route models

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::service::{ImageRef, RouteRule};

/// Opaque reference to a container owned by the runtime adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(pub String);

impl InstanceHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A handle bound to the version it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub handle: InstanceHandle,
    pub version: String,
    pub image: ImageRef,
}

/// Health of an instance as last observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Live container as reported by the runtime adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInstance {
    pub handle: InstanceHandle,
    pub image: String,
    pub networks: Vec<String>,
    pub running: bool,
    pub health: HealthStatus,
}

/// Route currently active in the reverse proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRegistration {
    pub service: String,
    pub rule: RouteRule,
    pub port: u16,
    pub target: InstanceHandle,
}
