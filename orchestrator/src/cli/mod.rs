//! Command line interface

pub mod output;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use secrecy::SecretString;
use tracing::debug;

use crate::app::options::AppOptions;
use crate::app::run::run;
use crate::bootstrap::Bootstrap;
use crate::deploy::attempts::AttemptBook;
use crate::deploy::controller::build_status;
use crate::errors::{ErrorKind, OrchestratorError};
use crate::filesys::file::File;
use crate::http::client::ApiClient;
use crate::logs::{init_logging, LogLevel, LogOptions};
use crate::models::service::ServiceDeclarations;
use crate::models::status::ServiceStatus;
use crate::registry::ServiceRegistry;
use crate::runtime::docker::{DockerOptions, DockerRuntime};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::version_info;

/// shipyard - single-host deployment orchestrator
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory holding settings.json
    #[arg(long, env = "SHIPYARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the orchestrator API
    #[arg(long, env = "SHIPYARD_API", global = true)]
    pub api: Option<String>,

    /// API bearer token, overriding the settings file
    #[arg(long, env = "SHIPYARD_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator daemon and its HTTP API
    Serve,

    /// Prepare the host: directories, permissions and networks
    Init,

    /// Register or update the services declared in a YAML file
    Apply {
        /// Declaration file
        file: PathBuf,
    },

    /// Unregister a service
    Remove { service: String },

    /// Deploy a version of a service
    Deploy {
        service: String,

        /// Image tag or sha256 digest
        version: String,

        /// Return once the attempt is accepted instead of waiting for it
        #[arg(long)]
        detach: bool,
    },

    /// Show services, their current version and latest attempt
    Status { service: Option<String> },

    /// Cancel the in-progress deployment of a service
    Rollback { service: String },

    /// Print version information
    Version,
}

impl Cli {
    /// Run the command, returning the process exit code
    pub async fn run(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<i32, OrchestratorError> {
        let (layout, settings) = load_config(self.config.as_deref()).await?;

        let log_options = match self.command {
            Commands::Serve => LogOptions {
                log_level: settings.log_level,
                stdout: true,
                log_dir: Some(layout.logs_dir().path().to_path_buf()),
                json_format: settings.log_json,
            },
            _ => LogOptions {
                log_level: LogLevel::Warn,
                ..Default::default()
            },
        };
        let _log_guard = init_logging(log_options)?;

        let token = self
            .token
            .clone()
            .map(SecretString::from)
            .or_else(|| settings.api_token.clone());
        let api_url = self
            .api
            .clone()
            .unwrap_or_else(|| settings.server.url());

        match self.command {
            Commands::Serve => {
                run(AppOptions::new(layout, settings), shutdown_signal).await?;
                Ok(0)
            }
            Commands::Init => init(layout, settings).await,
            Commands::Apply { file } => {
                let decls = ServiceDeclarations {
                    services: ServiceRegistry::load_declarations(&File::new(file)).await?,
                };
                let client = ApiClient::new(&api_url, token)?;
                let registered = client.apply(&decls).await?;
                for name in registered {
                    println!("{} {}", "registered".green(), name);
                }
                Ok(0)
            }
            Commands::Remove { service } => {
                let client = ApiClient::new(&api_url, token)?;
                let removed = client.remove(&service).await?;
                println!("{} {}", "removed".green(), removed.spec.name);
                Ok(0)
            }
            Commands::Deploy {
                service,
                version,
                detach,
            } => {
                let client = ApiClient::new(&api_url, token)?;
                let attempt = client.deploy(&service, &version).await?;
                println!(
                    "{} {} {} ({})",
                    "deploying".cyan(),
                    service,
                    version,
                    attempt.id
                );
                if detach {
                    return Ok(0);
                }

                let attempt = client.attempt(&attempt.id, true).await?;
                output::print_attempt(&attempt);
                Ok(attempt.exit_code())
            }
            Commands::Status { service } => {
                let client = ApiClient::new(&api_url, token)?;
                let statuses = match client.status(service.as_deref()).await {
                    Ok(statuses) => statuses,
                    Err(e) if e.kind() == ErrorKind::ApiUnreachable => {
                        debug!("API unreachable: {}", e);
                        eprintln!(
                            "{}",
                            "daemon unreachable, showing persisted state".yellow()
                        );
                        persisted_status(&layout, &settings, service.as_deref()).await?
                    }
                    Err(e) => return Err(e),
                };
                output::print_statuses(&statuses);
                Ok(0)
            }
            Commands::Rollback { service } => {
                let client = ApiClient::new(&api_url, token)?;
                let attempt = client.rollback(&service).await?;
                println!(
                    "{} {} {} ({})",
                    "rollback requested for".yellow(),
                    attempt.service,
                    attempt.version,
                    attempt.id
                );
                Ok(0)
            }
            Commands::Version => {
                println!("{}", serde_json::to_string_pretty(&version_info())?);
                Ok(0)
            }
        }
    }
}

async fn load_config(config: Option<&std::path::Path>) -> anyhow::Result<(StorageLayout, Settings)> {
    let layout = config.map(StorageLayout::new).unwrap_or_default();
    let settings_file = layout.settings_file();
    let settings: Settings = settings_file
        .read_json_or_default()
        .await
        .with_context(|| format!("reading {}", settings_file.path().display()))?;
    let layout = layout.with_settings(&settings);
    Ok((layout, settings))
}

async fn init(layout: StorageLayout, settings: Settings) -> Result<i32, OrchestratorError> {
    let runtime = Arc::new(DockerRuntime::new(DockerOptions {
        binary: settings.docker.binary.clone(),
    })?);
    let bootstrap = Bootstrap::new(layout, settings, runtime);
    for step in bootstrap.plan() {
        println!("{} {}", "-".dimmed(), step);
    }

    let reports = bootstrap.run().await?;
    for report in &reports {
        output::print_bootstrap_step(report);
    }
    Ok(0)
}

async fn persisted_status(
    layout: &StorageLayout,
    settings: &Settings,
    service: Option<&str>,
) -> Result<Vec<ServiceStatus>, OrchestratorError> {
    let registry = ServiceRegistry::open(layout.registry_file()).await?;
    let attempts = AttemptBook::open(layout.attempts_file(), settings.controller.history_limit).await?;

    let entries = match service {
        Some(name) => vec![registry.get(name).await?],
        None => registry.list().await,
    };

    let mut statuses = Vec::with_capacity(entries.len());
    for entry in entries {
        let latest = attempts.latest_for(&entry.spec.name).await;
        statuses.push(build_status(entry, latest, None));
    }
    Ok(statuses)
}
