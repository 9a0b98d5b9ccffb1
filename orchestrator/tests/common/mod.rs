//! In-memory adapters shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use shipyard::deploy::attempts::AttemptBook;
use shipyard::deploy::controller::{ControllerOptions, DeploymentController};
use shipyard::deploy::fsm::AttemptState;
use shipyard::errors::OrchestratorError;
use shipyard::filesys::file::File;
use shipyard::models::attempt::DeploymentAttempt;
use shipyard::models::instance::{HealthStatus, InstanceHandle, RouteRegistration, RunningInstance};
use shipyard::models::service::{RouteRule, ServiceSpec};
use shipyard::registry::ServiceRegistry;
use shipyard::router::Router;
use shipyard::runtime::ContainerRuntime;
use shipyard::secrets::{SecretBundle, SecretStore};
use shipyard::utils::CooldownOptions;

// ================================ RUNTIME ======================================= //

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub service: String,
    pub version: String,
    pub running: bool,
    pub env_keys: Vec<String>,
}

#[derive(Default)]
struct RuntimeInner {
    containers: BTreeMap<String, FakeContainer>,
    networks: HashSet<String>,
    unhealthy_versions: HashSet<String>,
    fail_create: bool,
    remove_failures: u32,
    calls: Vec<String>,
}

/// Container runtime that keeps containers in a map
#[derive(Default)]
pub struct MemoryRuntime {
    inner: Mutex<RuntimeInner>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes of instances running `version` report unhealthy
    pub fn mark_unhealthy(&self, version: &str) {
        self.inner
            .lock()
            .unwrap()
            .unhealthy_versions
            .insert(version.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    /// The next `n` removals fail
    pub fn fail_removals(&self, n: u32) {
        self.inner.lock().unwrap().remove_failures = n;
    }

    pub fn containers(&self) -> BTreeMap<String, FakeContainer> {
        self.inner.lock().unwrap().containers.clone()
    }

    pub fn live_versions(&self, service: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.service == service)
            .map(|c| c.version.clone())
            .collect()
    }

    pub fn networks(&self) -> HashSet<String> {
        self.inner.lock().unwrap().networks.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create(
        &self,
        spec: &ServiceSpec,
        secrets: &SecretBundle,
        name: &str,
    ) -> Result<InstanceHandle, OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("create {name}"));
        if inner.fail_create {
            return Err(OrchestratorError::runtime("create", "image pull failed"));
        }
        inner.containers.insert(
            name.to_string(),
            FakeContainer {
                service: spec.name.clone(),
                version: spec.image.version().to_string(),
                running: false,
                env_keys: secrets.keys().map(str::to_string).collect(),
            },
        );
        Ok(InstanceHandle::new(name))
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("start {handle}"));
        match inner.containers.get_mut(handle.as_str()) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(OrchestratorError::runtime("start", "No such container")),
        }
    }

    async fn stop(&self, handle: &InstanceHandle, _grace: Duration) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("stop {handle}"));
        if let Some(c) = inner.containers.get_mut(handle.as_str()) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("remove {handle}"));
        if inner.remove_failures > 0 {
            inner.remove_failures -= 1;
            return Err(OrchestratorError::runtime("remove", "device busy"));
        }
        inner.containers.remove(handle.as_str());
        Ok(())
    }

    async fn attach_network(
        &self,
        handle: &InstanceHandle,
        network: &str,
    ) -> Result<(), OrchestratorError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(format!("attach {handle} {network}"));
        Ok(())
    }

    async fn probe_health(
        &self,
        handle: &InstanceHandle,
        _spec: &ServiceSpec,
    ) -> Result<HealthStatus, OrchestratorError> {
        let inner = self.inner.lock().unwrap();
        let status = match inner.containers.get(handle.as_str()) {
            None => HealthStatus::Unhealthy("no such container".to_string()),
            Some(c) if !c.running => HealthStatus::Unhealthy("not running".to_string()),
            Some(c) if inner.unhealthy_versions.contains(&c.version) => {
                HealthStatus::Unhealthy("HTTP 503".to_string())
            }
            Some(_) => HealthStatus::Healthy,
        };
        Ok(status)
    }

    async fn inspect(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<RunningInstance>, OrchestratorError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.containers.get(handle.as_str()).map(|c| RunningInstance {
            handle: handle.clone(),
            image: c.version.clone(),
            networks: Vec::new(),
            running: c.running,
            health: HealthStatus::Unknown,
        }))
    }

    async fn ensure_network(&self, name: &str) -> Result<(), OrchestratorError> {
        self.inner.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }
}

// ================================= ROUTER ======================================= //

/// Router keeping registrations in a map
#[derive(Default)]
pub struct MemoryRouter {
    routes: Mutex<BTreeMap<String, RouteRegistration>>,
    write_failures: Mutex<u32>,
    read_failures: Mutex<u32>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` route registrations or swaps fail
    pub fn fail_writes(&self, n: u32) {
        *self.write_failures.lock().unwrap() = n;
    }

    /// The next `n` route lookups fail
    pub fn fail_reads(&self, n: u32) {
        *self.read_failures.lock().unwrap() = n;
    }

    fn take_failure(counter: &Mutex<u32>, op: &str) -> Result<(), OrchestratorError> {
        let mut left = counter.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(OrchestratorError::RouterUnreachable(format!("{op}: connection refused")));
        }
        Ok(())
    }

    pub fn target_of(&self, service: &str) -> Option<InstanceHandle> {
        self.routes
            .lock()
            .unwrap()
            .get(service)
            .map(|r| r.target.clone())
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn register_route(
        &self,
        service: &str,
        rule: &RouteRule,
        port: u16,
        target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError> {
        Self::take_failure(&self.write_failures, "register")?;
        let mut routes = self.routes.lock().unwrap();
        if let Some(owner) = routes
            .values()
            .find(|r| r.rule.host == rule.host && r.service != service)
        {
            return Err(OrchestratorError::RuleConflict {
                host: rule.host.clone(),
                owner: owner.service.clone(),
            });
        }
        let registration = RouteRegistration {
            service: service.to_string(),
            rule: rule.clone(),
            port,
            target: target.clone(),
        };
        routes.insert(service.to_string(), registration.clone());
        Ok(registration)
    }

    async fn deregister_route(&self, service: &str) -> Result<(), OrchestratorError> {
        self.routes.lock().unwrap().remove(service);
        Ok(())
    }

    async fn swap_target(
        &self,
        service: &str,
        new_target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError> {
        Self::take_failure(&self.write_failures, "swap")?;
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .get_mut(service)
            .ok_or_else(|| OrchestratorError::NotFound(format!("route for {service}")))?;
        let previous = route.clone();
        route.target = new_target.clone();
        Ok(previous)
    }

    async fn current(&self, service: &str) -> Result<Option<RouteRegistration>, OrchestratorError> {
        Self::take_failure(&self.read_failures, "current")?;
        Ok(self.routes.lock().unwrap().get(service).cloned())
    }

    async fn ping(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

// ================================= SECRETS ====================================== //

/// Secret store backed by a map; services without an entry have no file
#[derive(Default)]
pub struct MemorySecretStore {
    bundles: HashMap<String, Vec<(String, String)>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: &str, pairs: &[(&str, &str)]) -> Self {
        self.bundles.insert(
            service.to_string(),
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn load(&self, service: &str, optional: bool) -> Result<SecretBundle, OrchestratorError> {
        let mut bundle = SecretBundle::new(service);
        match self.bundles.get(service) {
            Some(pairs) => {
                for (k, v) in pairs {
                    bundle.insert(k.clone(), v.clone());
                }
                Ok(bundle)
            }
            None if optional => Ok(bundle),
            None => Err(OrchestratorError::SecretsUnavailable(format!(
                "no secrets for {service}"
            ))),
        }
    }
}

// ================================= HARNESS ====================================== //

pub fn fast_options() -> ControllerOptions {
    ControllerOptions {
        dependency_timeout: Duration::from_secs(5),
        drain_grace: Duration::from_millis(20),
        router_timeout: Duration::from_secs(1),
        removal_retries: 3,
        removal_backoff: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
    }
}

/// A controller wired to in-memory adapters with state in a temp dir
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<ServiceRegistry>,
    pub attempts: Arc<AttemptBook>,
    pub runtime: Arc<MemoryRuntime>,
    pub router: Arc<MemoryRouter>,
    pub controller: Arc<DeploymentController>,
}

impl Harness {
    pub async fn new(options: ControllerOptions) -> Self {
        Self::with_secrets(options, MemorySecretStore::new()).await
    }

    pub async fn with_secrets(options: ControllerOptions, secrets: MemorySecretStore) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ServiceRegistry::open(File::new(dir.path().join("registry.json")))
                .await
                .unwrap(),
        );
        let attempts = Arc::new(
            AttemptBook::open(File::new(dir.path().join("attempts.json")), 20)
                .await
                .unwrap(),
        );
        let runtime = Arc::new(MemoryRuntime::new());
        let router = Arc::new(MemoryRouter::new());
        let controller = Arc::new(DeploymentController::new(
            registry.clone(),
            Arc::new(secrets),
            runtime.clone(),
            router.clone(),
            attempts.clone(),
            options,
        ));

        Self {
            dir,
            registry,
            attempts,
            runtime,
            router,
            controller,
        }
    }

    pub async fn register(&self, yaml: &str) {
        let spec: ServiceSpec = serde_yaml::from_str(yaml).unwrap();
        self.registry.register(spec).await.unwrap();
    }

    /// Deploy and wait for the attempt to finish
    pub async fn deploy(&self, service: &str, version: &str) -> DeploymentAttempt {
        let attempt = self.controller.deploy(service, version).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.controller.wait(&attempt.id))
            .await
            .expect("attempt did not finish")
            .unwrap()
    }

    /// Poll until attempt `id` reaches `state`
    pub async fn wait_for_state(&self, id: &str, state: AttemptState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let attempt = self.controller.attempt(id).await.unwrap();
            if attempt.state == state {
                return;
            }
            assert!(
                !attempt.is_terminal(),
                "attempt ended {} before reaching {}",
                attempt.state,
                state
            );
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {state}");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Public web service with a fast health check
pub fn web_yaml(name: &str, host: &str) -> String {
    format!(
        r#"
name: {name}
image: ghcr.io/acme/{name}:v1
networks: [web, internal]
port: 8080
route:
  host: {host}
health_check:
  http: /health
  interval: 5ms
  timeout: 100ms
  retries: 3
optional_secrets: true
"#
    )
}

/// Internal service without a route
pub fn internal_yaml(name: &str, depends_on: &[&str]) -> String {
    format!(
        r#"
name: {name}
image: ghcr.io/acme/{name}:v1
networks: [internal]
port: 5432
depends_on: [{}]
health_check:
  interval: 5ms
  timeout: 100ms
  retries: 3
optional_secrets: true
"#,
        depends_on.join(", ")
    )
}
