//! Container runtime adapter
//!
//! Thin interface over the container engine. Implementations are idempotent
//! on already-correct state and never retry internally; retry policy belongs
//! to the deployment controller.

pub mod docker;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::OrchestratorError;
use crate::models::instance::{HealthStatus, InstanceHandle, RunningInstance};
use crate::models::service::ServiceSpec;
use crate::secrets::SecretBundle;

/// Label keys stamped on every managed container
pub const LABEL_SERVICE: &str = "shipyard.service";
pub const LABEL_VERSION: &str = "shipyard.version";

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container named `name` for `spec`
    async fn create(
        &self,
        spec: &ServiceSpec,
        secrets: &SecretBundle,
        name: &str,
    ) -> Result<InstanceHandle, OrchestratorError>;

    /// Start a created container; starting a running one succeeds
    async fn start(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError>;

    /// Stop a container, giving it `grace` before it is killed
    async fn stop(&self, handle: &InstanceHandle, grace: Duration) -> Result<(), OrchestratorError>;

    /// Remove a container; removing a missing one succeeds
    async fn remove(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError>;

    /// Join an additional network
    async fn attach_network(
        &self,
        handle: &InstanceHandle,
        network: &str,
    ) -> Result<(), OrchestratorError>;

    /// Run one readiness probe as declared in `spec.health_check`
    async fn probe_health(
        &self,
        handle: &InstanceHandle,
        spec: &ServiceSpec,
    ) -> Result<HealthStatus, OrchestratorError>;

    /// Current view of a container, `None` if it does not exist
    async fn inspect(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<RunningInstance>, OrchestratorError>;

    /// Create a network if it does not exist yet
    async fn ensure_network(&self, name: &str) -> Result<(), OrchestratorError>;
}

/// Fresh, unique container name for one attempt
pub fn instance_name(service: &str, version: &str, attempt_id: &str) -> String {
    let version: String = version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .take(32)
        .collect();
    let short_id: String = attempt_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{service}-{version}-{short_id}")
}
