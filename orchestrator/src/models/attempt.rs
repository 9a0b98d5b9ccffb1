//! Deployment attempt models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{next_state, AttemptEvent, AttemptState};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::models::instance::{InstanceHandle, InstanceRef};
use crate::models::service::ServiceSpec;

/// Final result of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RolledBack,
    Failed,
}

/// Why an attempt did not commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestratorError> for AttemptError {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Individual step performed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    WaitDependencies,
    LoadSecrets,
    CreateInstance,
    AttachNetwork,
    StartInstance,
    Probe,
    Cutover,
    Drain,
    StopPrevious,
    RemovePrevious,
    CommitRegistry,
    RemoveNew,
    RestoreRoute,
    VerifyPrevious,
    Recover,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::WaitDependencies => "wait_dependencies",
            StepKind::LoadSecrets => "load_secrets",
            StepKind::CreateInstance => "create_instance",
            StepKind::AttachNetwork => "attach_network",
            StepKind::StartInstance => "start_instance",
            StepKind::Probe => "probe",
            StepKind::Cutover => "cutover",
            StepKind::Drain => "drain",
            StepKind::StopPrevious => "stop_previous",
            StepKind::RemovePrevious => "remove_previous",
            StepKind::CommitRegistry => "commit_registry",
            StepKind::RemoveNew => "remove_new",
            StepKind::RestoreRoute => "restore_route",
            StepKind::VerifyPrevious => "verify_previous",
            StepKind::Recover => "recover",
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One transition of a service from its current instance to a new one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: String,
    pub service: String,
    pub version: String,
    pub target: ServiceSpec,
    pub previous: Option<InstanceRef>,
    pub new_instance: Option<InstanceHandle>,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub error: Option<AttemptError>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub route_touched: bool,
    #[serde(default)]
    pub steps: Vec<StepResult>,
}

impl DeploymentAttempt {
    pub fn new(
        id: String,
        target: ServiceSpec,
        version: String,
        previous: Option<InstanceRef>,
    ) -> Self {
        Self {
            id,
            service: target.name.clone(),
            version,
            target,
            previous,
            new_instance: None,
            state: AttemptState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
            cancel_requested: false,
            route_touched: false,
            steps: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply an event, stamping the outcome when a terminal state is reached
    pub fn apply(&mut self, event: AttemptEvent) -> Result<AttemptState, OrchestratorError> {
        let next = next_state(self.state, event).map_err(OrchestratorError::Internal)?;
        self.state = next;

        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.outcome = Some(match next {
                AttemptState::Committed => Outcome::Success,
                AttemptState::RolledBack => Outcome::RolledBack,
                _ => Outcome::Failed,
            });
        }

        Ok(next)
    }

    /// Record the first error that derailed the attempt
    pub fn record_error(&mut self, err: &OrchestratorError) {
        if self.error.is_none() {
            self.error = Some(AttemptError::from(err));
        }
    }

    pub fn push_step(&mut self, step: StepResult) {
        self.steps.push(step);
    }

    /// Exit code the CLI reports for this attempt
    pub fn exit_code(&self) -> i32 {
        match (self.outcome, &self.error) {
            (Some(Outcome::Success), _) => 0,
            (Some(Outcome::Failed), None) => ErrorKind::Failed.exit_code(),
            (_, Some(error)) => error.kind.exit_code(),
            (_, None) => ErrorKind::Internal.exit_code(),
        }
    }
}

/// Timer for a single step
pub struct StepTimer {
    step: StepKind,
    started_at: DateTime<Utc>,
}

impl StepTimer {
    pub fn start(step: StepKind) -> Self {
        Self {
            step,
            started_at: Utc::now(),
        }
    }

    pub fn ok(self, detail: Option<String>) -> StepResult {
        self.finish(true, detail)
    }

    pub fn failed(self, detail: impl Into<String>) -> StepResult {
        self.finish(false, Some(detail.into()))
    }

    fn finish(self, ok: bool, detail: Option<String>) -> StepResult {
        StepResult {
            step: self.step,
            started_at: self.started_at,
            finished_at: Utc::now(),
            ok,
            detail,
        }
    }
}
