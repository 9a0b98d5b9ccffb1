//! Host bootstrap
//!
//! An ordered list of idempotent steps that prepare the host for the
//! orchestrator. Running the list twice is a no-op the second time.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::runtime::ContainerRuntime;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// One provisioning step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", content = "target", rename_all = "snake_case")]
pub enum BootstrapStep {
    /// Write default settings when none exist
    SettingsFile,
    StateDir,
    /// Owner-only secrets directory
    SecretsDir,
    RoutesDir,
    LogsDir,
    Network(String),
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStep::SettingsFile => write!(f, "settings file"),
            BootstrapStep::StateDir => write!(f, "state directory"),
            BootstrapStep::SecretsDir => write!(f, "secrets directory"),
            BootstrapStep::RoutesDir => write!(f, "routes directory"),
            BootstrapStep::LogsDir => write!(f, "logs directory"),
            BootstrapStep::Network(name) => write!(f, "network {name}"),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: BootstrapStep,
    pub tries: u32,
    pub error: Option<String>,
}

impl StepReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Bootstrap {
    layout: StorageLayout,
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    retries: u32,
    backoff: CooldownOptions,
}

impl Bootstrap {
    pub fn new(layout: StorageLayout, settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            layout,
            settings,
            runtime,
            retries: 3,
            backoff: CooldownOptions::default(),
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: CooldownOptions) -> Self {
        self.retries = retries.max(1);
        self.backoff = backoff;
        self
    }

    /// The steps `run` will execute, in order
    pub fn plan(&self) -> Vec<BootstrapStep> {
        let mut steps = vec![
            BootstrapStep::SettingsFile,
            BootstrapStep::StateDir,
            BootstrapStep::SecretsDir,
            BootstrapStep::RoutesDir,
            BootstrapStep::LogsDir,
        ];
        steps.extend(self.settings.networks.iter().cloned().map(BootstrapStep::Network));
        steps
    }

    /// Run every step, stopping at the first directory step that keeps
    /// failing. Networks are created concurrently.
    pub async fn run(&self) -> Result<Vec<StepReport>, OrchestratorError> {
        let (networks, local): (Vec<_>, Vec<_>) = self
            .plan()
            .into_iter()
            .partition(|s| matches!(s, BootstrapStep::Network(_)));

        let mut reports = Vec::new();
        for step in local {
            let report = self.run_step(step).await;
            let failed = report.error.clone();
            reports.push(report);
            if let Some(error) = failed {
                return Err(OrchestratorError::ConfigError(error));
            }
        }

        let network_reports = join_all(networks.into_iter().map(|s| self.run_step(s))).await;
        reports.extend(network_reports);

        let failed: Vec<String> = reports
            .iter()
            .filter(|r| !r.ok())
            .map(|r| r.step.to_string())
            .collect();
        if !failed.is_empty() {
            return Err(OrchestratorError::runtime(
                "bootstrap",
                format!("failed steps: {}", failed.join(", ")),
            ));
        }

        info!("Host bootstrap complete ({} steps)", reports.len());
        Ok(reports)
    }

    async fn run_step(&self, step: BootstrapStep) -> StepReport {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.apply(&step).await {
                Ok(()) => {
                    info!("Bootstrap: {} ready", step);
                    return StepReport {
                        step,
                        tries,
                        error: None,
                    };
                }
                Err(e) if tries < self.retries => {
                    let delay = calc_exp_backoff(&self.backoff, tries - 1);
                    warn!("Bootstrap: {} failed ({}), retrying in {:?}", step, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return StepReport {
                        step,
                        tries,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    async fn apply(&self, step: &BootstrapStep) -> Result<(), OrchestratorError> {
        match step {
            BootstrapStep::SettingsFile => {
                let file = self.layout.settings_file();
                if !file.exists().await {
                    file.write_json(&self.settings).await?;
                    file.set_permissions_600().await?;
                }
                Ok(())
            }
            BootstrapStep::StateDir => self.layout.state_dir().create().await,
            BootstrapStep::SecretsDir => self.layout.secrets_dir().create_private().await,
            BootstrapStep::RoutesDir => self.layout.routes_dir().create().await,
            BootstrapStep::LogsDir => self.layout.logs_dir().create().await,
            BootstrapStep::Network(name) => self.runtime.ensure_network(name).await,
        }
    }
}
