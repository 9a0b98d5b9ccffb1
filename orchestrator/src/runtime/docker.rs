//! Docker runtime driven through the `docker` CLI

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::models::instance::{HealthStatus, InstanceHandle, RunningInstance};
use crate::models::service::{Probe, ServiceSpec};
use crate::runtime::{ContainerRuntime, LABEL_SERVICE, LABEL_VERSION};
use crate::secrets::SecretBundle;

/// Docker runtime settings
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Path or name of the docker binary
    pub binary: String,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

pub struct DockerRuntime {
    options: DockerOptions,
    http: reqwest::Client,
}

impl DockerRuntime {
    pub fn new(options: DockerOptions) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { options, http })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.options.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, operation: &str, mut cmd: Command) -> Result<Output, OrchestratorError> {
        cmd.output()
            .await
            .map_err(|e| OrchestratorError::runtime(operation, format!("failed to run docker: {e}")))
    }

    /// Run a docker command, mapping a non-zero exit to `RuntimeError`
    async fn run(&self, operation: &str, args: Vec<String>) -> Result<String, OrchestratorError> {
        debug!("docker {}", args.join(" "));
        let output = self.output(operation, self.command(&args)).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(OrchestratorError::runtime(operation, stderr_of(&output)))
        }
    }

    async fn inspect_raw(&self, name: &str) -> Result<Option<InspectContainer>, OrchestratorError> {
        let args = vec!["container".into(), "inspect".into(), name.to_string()];
        let output = self.output("inspect", self.command(&args)).await?;

        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(OrchestratorError::runtime("inspect", stderr));
        }

        let mut containers: Vec<InspectContainer> = serde_json::from_slice(&output.stdout)
            .map_err(|e| OrchestratorError::runtime("inspect", format!("unexpected output: {e}")))?;
        Ok(containers.pop())
    }

    async fn probe_http(&self, url: &str, timeout: Duration) -> HealthStatus {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                HealthStatus::Healthy
            }
            Ok(resp) => HealthStatus::Unhealthy(format!("GET {} returned {}", url, resp.status())),
            Err(e) => HealthStatus::Unhealthy(format!("GET {url} failed: {e}")),
        }
    }

    async fn probe_command(&self, name: &str, cmd: &[String], timeout: Duration) -> HealthStatus {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(cmd.iter().cloned());

        match tokio::time::timeout(timeout, self.output("probe", self.command(&args))).await {
            Ok(Ok(output)) if output.status.success() => HealthStatus::Healthy,
            Ok(Ok(output)) => HealthStatus::Unhealthy(format!(
                "{} exited with {}: {}",
                cmd.join(" "),
                output.status,
                stderr_of(&output)
            )),
            Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
            Err(_) => HealthStatus::Unhealthy(format!("{} timed out after {:?}", cmd.join(" "), timeout)),
        }
    }
}

/// Arguments for `docker create`.
///
/// Secret keys are passed as bare `-e KEY`; docker reads the values from
/// its own environment, so they never appear on the command line.
pub fn create_args<'a>(
    spec: &ServiceSpec,
    name: &str,
    secret_keys: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--pull".to_string(),
        "missing".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        "--label".to_string(),
        format!("{}={}", LABEL_SERVICE, spec.name),
        "--label".to_string(),
        format!("{}={}", LABEL_VERSION, spec.image.version()),
    ];

    if let Some(network) = spec.primary_network() {
        args.push("--network".to_string());
        args.push(network.to_string());
        args.push("--network-alias".to_string());
        args.push(name.to_string());
    }

    for key in secret_keys {
        args.push("-e".to_string());
        args.push(key.to_string());
    }

    args.push(spec.image.to_string());
    args
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(
        &self,
        spec: &ServiceSpec,
        secrets: &SecretBundle,
        name: &str,
    ) -> Result<InstanceHandle, OrchestratorError> {
        if let Some(existing) = self.inspect_raw(name).await? {
            if existing.config.image == spec.image.to_string() {
                debug!("Container {} already exists, reusing", name);
                return Ok(InstanceHandle::new(name));
            }
            return Err(OrchestratorError::runtime(
                "create",
                format!("container {} exists with image {}", name, existing.config.image),
            ));
        }

        let args = create_args(spec, name, secrets.keys());
        debug!("docker {}", args.join(" "));

        let mut cmd = self.command(&args);
        cmd.envs(secrets.expose());
        let output = self.output("create", cmd).await?;
        if !output.status.success() {
            return Err(OrchestratorError::runtime("create", stderr_of(&output)));
        }

        info!("Created container {} from {}", name, spec.image);
        Ok(InstanceHandle::new(name))
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        self.run("start", vec!["start".into(), handle.to_string()]).await?;
        Ok(())
    }

    async fn stop(&self, handle: &InstanceHandle, grace: Duration) -> Result<(), OrchestratorError> {
        match self.run("stop", stop_args(handle, grace)).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::RuntimeError { cause, .. }) if is_missing(&cause) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        let args = vec!["rm".to_string(), "--force".to_string(), handle.to_string()];
        match self.run("remove", args).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::RuntimeError { cause, .. }) if is_missing(&cause) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn attach_network(
        &self,
        handle: &InstanceHandle,
        network: &str,
    ) -> Result<(), OrchestratorError> {
        let args = vec![
            "network".to_string(),
            "connect".to_string(),
            network.to_string(),
            handle.to_string(),
        ];
        match self.run("attach_network", args).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::RuntimeError { cause, .. }) if cause.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn probe_health(
        &self,
        handle: &InstanceHandle,
        spec: &ServiceSpec,
    ) -> Result<HealthStatus, OrchestratorError> {
        let container = match self.inspect_raw(handle.as_str()).await? {
            Some(c) => c,
            None => return Ok(HealthStatus::Unhealthy("container does not exist".to_string())),
        };
        if !container.state.running {
            return Ok(HealthStatus::Unhealthy("container is not running".to_string()));
        }

        let hc = &spec.health_check;
        let status = match hc.probe() {
            Probe::Running => HealthStatus::Healthy,
            Probe::Command(cmd) => self.probe_command(handle.as_str(), cmd, hc.timeout).await,
            Probe::Http(path) => {
                let ip = spec
                    .primary_network()
                    .and_then(|n| container.network_settings.networks.get(n))
                    .map(|e| e.ip_address.clone())
                    .filter(|ip| !ip.is_empty());
                match ip {
                    Some(ip) => {
                        let url = format!("http://{}:{}{}", ip, spec.port, path);
                        self.probe_http(&url, hc.timeout).await
                    }
                    None => HealthStatus::Unhealthy("no address on primary network".to_string()),
                }
            }
        };

        Ok(status)
    }

    async fn inspect(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<RunningInstance>, OrchestratorError> {
        let container = match self.inspect_raw(handle.as_str()).await? {
            Some(c) => c,
            None => return Ok(None),
        };

        let health = match container.state.health.as_ref().map(|h| h.status.as_str()) {
            Some("healthy") => HealthStatus::Healthy,
            Some("unhealthy") => HealthStatus::Unhealthy("docker healthcheck failing".to_string()),
            _ => HealthStatus::Unknown,
        };

        let mut networks: Vec<String> = container.network_settings.networks.keys().cloned().collect();
        networks.sort();

        Ok(Some(RunningInstance {
            handle: handle.clone(),
            image: container.config.image,
            networks,
            running: container.state.running,
            health,
        }))
    }

    async fn ensure_network(&self, name: &str) -> Result<(), OrchestratorError> {
        let args = vec!["network".to_string(), "inspect".to_string(), name.to_string()];
        let output = self.output("ensure_network", self.command(&args)).await?;
        if output.status.success() {
            debug!("Network {} already exists", name);
            return Ok(());
        }

        self.run(
            "ensure_network",
            vec!["network".into(), "create".into(), name.to_string()],
        )
        .await?;
        info!("Created network {}", name);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: HashMap<String, InspectEndpoint>,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// `docker stop` arguments; the grace period is rounded up to whole seconds
fn stop_args(handle: &InstanceHandle, grace: Duration) -> Vec<String> {
    let seconds = grace.as_secs_f64().ceil() as u64;
    vec![
        "stop".to_string(),
        "--time".to_string(),
        seconds.to_string(),
        handle.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        serde_yaml::from_str(
            r#"
name: api
image: ghcr.io/acme/api:v2
networks: [web, internal]
port: 8080
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_stop_grace_rounds_up() {
        let handle = InstanceHandle::new("api-v2-0f3c9a2e");
        let secs = |grace| stop_args(&handle, grace)[2].clone();

        assert_eq!(secs(Duration::ZERO), "0");
        assert_eq!(secs(Duration::from_millis(200)), "1");
        assert_eq!(secs(Duration::from_millis(1500)), "2");
        assert_eq!(secs(Duration::from_secs(10)), "10");
        assert_eq!(stop_args(&handle, Duration::ZERO)[3], "api-v2-0f3c9a2e");
    }

    #[test]
    fn test_create_args_keep_values_off_argv() {
        let mut bundle = SecretBundle::new("api");
        bundle.insert("DATABASE_URL", "postgres://user:hunter2@db/app");

        let args = create_args(&spec(), "api-v2-0f3c9a2e", bundle.keys());
        let joined = args.join(" ");

        assert!(joined.starts_with("create --pull missing --name api-v2-0f3c9a2e"));
        assert!(joined.contains("--network web"));
        assert!(!joined.contains("--network internal"));
        assert!(joined.contains("-e DATABASE_URL"));
        assert!(!joined.contains("hunter2"));
        assert!(joined.contains("--label shipyard.version=v2"));
        assert_eq!(args.last().unwrap(), "ghcr.io/acme/api:v2");
    }

    #[test]
    fn test_parse_inspect_output() {
        let raw = r#"[{
            "Id": "abc",
            "State": {"Running": true, "Health": {"Status": "healthy"}},
            "Config": {"Image": "ghcr.io/acme/api:v2"},
            "NetworkSettings": {"Networks": {"web": {"IPAddress": "172.18.0.5"}}}
        }]"#;
        let mut parsed: Vec<InspectContainer> = serde_json::from_str(raw).unwrap();
        let container = parsed.pop().unwrap();
        assert!(container.state.running);
        assert_eq!(container.config.image, "ghcr.io/acme/api:v2");
        assert_eq!(container.network_settings.networks["web"].ip_address, "172.18.0.5");
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing("Error response from daemon: No such container: api-v1"));
        assert!(is_missing("Error: No such object: api-v1"));
        assert!(!is_missing("permission denied while trying to connect"));
    }
}
