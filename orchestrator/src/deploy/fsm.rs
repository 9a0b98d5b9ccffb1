//! Finite state machine for a deployment attempt

use serde::{Deserialize, Serialize};

/// Attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Created, waiting for dependencies
    Pending,

    /// Secrets loaded, new instance being created and started
    Provisioning,

    /// Polling the new instance until it reports healthy
    HealthChecking,

    /// Switching the route to the new instance
    Cutover,

    /// Previous instance finishing in-flight work
    Draining,

    /// New instance routed, previous removed
    Committed,

    /// Undoing a partially applied attempt
    RollingBack,

    /// Previous instance restored and routed
    RolledBack,

    /// No known-good instance could be kept or restored
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed | AttemptState::RolledBack | AttemptState::Failed
        )
    }

    /// Whether the route may already point at the new instance
    pub fn past_cutover(&self) -> bool {
        matches!(self, AttemptState::Cutover | AttemptState::Draining)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Provisioning => "provisioning",
            AttemptState::HealthChecking => "health_checking",
            AttemptState::Cutover => "cutover",
            AttemptState::Draining => "draining",
            AttemptState::Committed => "committed",
            AttemptState::RollingBack => "rolling_back",
            AttemptState::RolledBack => "rolled_back",
            AttemptState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    /// All dependencies committed
    DependenciesReady,

    /// New instance created and started
    Provisioned,

    /// Provisioning failed with the previous instance untouched
    ProvisionFailed,

    /// New instance reported healthy
    Healthy,

    /// Route now points at the new instance
    CutOver,

    /// Drain grace elapsed and previous instance stopped
    Drained,

    /// Start undoing the attempt
    Abort,

    /// Rollback restored the previous instance
    RollbackComplete,

    /// Unrecoverable failure
    Fail,
}

/// Compute the state reached by applying `event` in `state`
pub fn next_state(state: AttemptState, event: AttemptEvent) -> Result<AttemptState, String> {
    use AttemptEvent as E;
    use AttemptState as S;

    let next = match (state, event) {
        (S::Pending, E::DependenciesReady) => S::Provisioning,
        (S::Provisioning, E::Provisioned) => S::HealthChecking,
        (S::Provisioning, E::ProvisionFailed) => S::RolledBack,
        (S::HealthChecking, E::Healthy) => S::Cutover,
        (S::Cutover, E::CutOver) => S::Draining,
        (S::Draining, E::Drained) => S::Committed,
        (S::RollingBack, E::RollbackComplete) => S::RolledBack,

        (s, E::Abort) if !s.is_terminal() && s != S::RollingBack => S::RollingBack,
        (s, E::Fail) if !s.is_terminal() => S::Failed,

        (state, event) => {
            return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
        }
    };

    Ok(next)
}
