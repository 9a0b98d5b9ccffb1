//! Per-service status view

use serde::{Deserialize, Serialize};

use crate::models::attempt::DeploymentAttempt;
use crate::models::instance::{InstanceRef, RouteRegistration};
use crate::models::service::ImageRef;

/// What `status` reports for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,

    /// Desired image as last committed or declared
    pub image: ImageRef,

    /// Committed instance
    pub current: Option<InstanceRef>,

    /// Active route, when the router could be asked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteRegistration>,

    /// Most recent attempt
    pub latest: Option<DeploymentAttempt>,

    pub in_progress: bool,
}
