//! Data models

pub mod attempt;
pub mod instance;
pub mod service;
pub mod status;

pub use attempt::{AttemptError, DeploymentAttempt, Outcome, StepKind, StepResult};
pub use instance::{HealthStatus, InstanceHandle, InstanceRef, RouteRegistration, RunningInstance};
pub use service::{HealthCheckSpec, ImageRef, Probe, RouteRule, ServiceDeclarations, ServiceSpec};
pub use status::ServiceStatus;
