//! Router adapter
//!
//! Maps public hostnames to exactly one backend instance at a time.

pub mod traefik;

use async_trait::async_trait;

use crate::errors::OrchestratorError;
use crate::models::instance::{InstanceHandle, RouteRegistration};
use crate::models::service::RouteRule;

#[async_trait]
pub trait Router: Send + Sync {
    /// Route `rule.host` to `target:port`.
    ///
    /// Re-registering the same service replaces its route. A host owned by
    /// another service fails with `RuleConflict`.
    async fn register_route(
        &self,
        service: &str,
        rule: &RouteRule,
        port: u16,
        target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError>;

    /// Drop the route of `service`; a missing route succeeds
    async fn deregister_route(&self, service: &str) -> Result<(), OrchestratorError>;

    /// Point an existing route at `new_target` in one step, returning the
    /// registration that was replaced
    async fn swap_target(
        &self,
        service: &str,
        new_target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError>;

    /// Active registration for `service`
    async fn current(&self, service: &str) -> Result<Option<RouteRegistration>, OrchestratorError>;

    /// Check that the proxy is reachable
    async fn ping(&self) -> Result<(), OrchestratorError>;
}
