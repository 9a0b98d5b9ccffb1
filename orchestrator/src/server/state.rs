//! Server state

use std::sync::Arc;

use secrecy::SecretString;

use crate::deploy::controller::DeploymentController;
use crate::registry::ServiceRegistry;

/// Server state shared across handlers
pub struct ServerState {
    pub controller: Arc<DeploymentController>,
    pub registry: Arc<ServiceRegistry>,

    /// Bearer token required on every route except `/health`
    pub api_token: Option<SecretString>,
}

impl ServerState {
    pub fn new(controller: Arc<DeploymentController>, api_token: Option<SecretString>) -> Self {
        Self {
            registry: controller.registry().clone(),
            controller,
            api_token,
        }
    }
}
