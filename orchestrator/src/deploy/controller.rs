//! Deployment controller
//!
//! Drives one attempt per service through the state machine in
//! [`crate::deploy::fsm`]. Each attempt runs in its own task and owns the
//! service lock until it reaches a terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::attempts::AttemptBook;
use crate::deploy::fsm::{AttemptEvent, AttemptState};
use crate::deploy::locks::ServiceLocks;
use crate::errors::OrchestratorError;
use crate::models::attempt::{DeploymentAttempt, StepKind, StepTimer};
use crate::models::instance::{HealthStatus, InstanceHandle, InstanceRef, RouteRegistration};
use crate::models::status::ServiceStatus;
use crate::registry::{RegistryEntry, ServiceRegistry};
use crate::router::Router;
use crate::runtime::{instance_name, ContainerRuntime};
use crate::secrets::SecretStore;
use crate::storage::settings::ControllerSettings;
use crate::utils::{calc_exp_backoff, format_duration, generate_uuid, CooldownOptions};

/// Controller timings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub dependency_timeout: Duration,
    pub drain_grace: Duration,
    pub router_timeout: Duration,
    pub removal_retries: u32,
    pub removal_backoff: CooldownOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions::from(&ControllerSettings::default())
    }
}

impl From<&ControllerSettings> for ControllerOptions {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            dependency_timeout: settings.dependency_timeout,
            drain_grace: settings.drain_grace,
            router_timeout: settings.router_timeout,
            removal_retries: settings.removal_retries.max(1),
            removal_backoff: CooldownOptions::default(),
        }
    }
}

pub struct DeploymentController {
    registry: Arc<ServiceRegistry>,
    secrets: Arc<dyn SecretStore>,
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<dyn Router>,
    attempts: Arc<AttemptBook>,
    locks: ServiceLocks,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    options: ControllerOptions,
}

impl DeploymentController {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        secrets: Arc<dyn SecretStore>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn Router>,
        attempts: Arc<AttemptBook>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            registry,
            secrets,
            runtime,
            router,
            attempts,
            locks: ServiceLocks::new(),
            cancels: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Start deploying `version` of `service`.
    ///
    /// Returns the freshly created attempt while it runs in the background.
    pub async fn deploy(
        self: &Arc<Self>,
        service: &str,
        version: &str,
    ) -> Result<DeploymentAttempt, OrchestratorError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(OrchestratorError::InvalidSpec("version is empty".to_string()));
        }

        let entry = self.registry.get(service).await?;
        let guard = self.locks.try_acquire(service)?;

        let attempt = DeploymentAttempt::new(
            generate_uuid(),
            entry.spec.with_version(version),
            version.to_string(),
            entry.current.clone(),
        );
        self.attempts.insert(attempt.clone()).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().await.insert(attempt.id.clone(), cancel_tx);

        info!(
            "Deploying {} {} (attempt {}, previous {})",
            service,
            version,
            attempt.id,
            entry
                .current
                .as_ref()
                .map(|c| c.version.as_str())
                .unwrap_or("none")
        );

        let controller = self.clone();
        let run = AttemptRun {
            ctl: self.clone(),
            attempt: attempt.clone(),
            cancel: cancel_rx,
            previous_route: None,
        };
        tokio::spawn(async move {
            let _guard = guard;
            let id = run.attempt.id.clone();
            run.execute().await;
            controller.cancels.lock().await.remove(&id);
        });

        Ok(attempt)
    }

    /// Request cancellation of the in-progress attempt of `service`
    pub async fn rollback(&self, service: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        self.registry.get(service).await?;

        let nothing = || {
            OrchestratorError::NothingToRollBack(format!("no deployment of {service} is in progress"))
        };
        let mut attempt = self.attempts.in_progress_for(service).await.ok_or_else(nothing)?;

        let cancels = self.cancels.lock().await;
        let tx = cancels.get(&attempt.id).ok_or_else(nothing)?;
        tx.send_replace(true);

        info!("Rollback requested for {} (attempt {})", service, attempt.id);
        attempt.cancel_requested = true;
        Ok(attempt)
    }

    /// Unregister a service with no attempt in flight
    pub async fn remove_service(&self, service: &str) -> Result<RegistryEntry, OrchestratorError> {
        let _guard = self.locks.try_acquire(service)?;
        self.registry.remove(service).await
    }

    /// Recorded attempts, newest first
    pub async fn history(&self, service: Option<&str>) -> Vec<DeploymentAttempt> {
        self.attempts.list(service).await
    }

    pub async fn attempt(&self, id: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        self.attempts
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("attempt {id}")))
    }

    /// Wait for attempt `id` to finish
    pub async fn wait(&self, id: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        self.attempts.wait_terminal(id).await
    }

    /// Status of one service, or of every registered service
    pub async fn status(&self, service: Option<&str>) -> Result<Vec<ServiceStatus>, OrchestratorError> {
        let entries = match service {
            Some(name) => vec![self.registry.get(name).await?],
            None => self.registry.list().await,
        };

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            let route = match self.router.current(&entry.spec.name).await {
                Ok(route) => route,
                Err(e) => {
                    warn!("Could not read route of {}: {}", entry.spec.name, e);
                    None
                }
            };
            let latest = self.attempts.latest_for(&entry.spec.name).await;
            statuses.push(build_status(entry, latest, route));
        }
        Ok(statuses)
    }

    /// Mark attempts interrupted by a previous process as failed.
    ///
    /// New instances that never received traffic are removed.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let stale: Vec<DeploymentAttempt> = self
            .attempts
            .list(None)
            .await
            .into_iter()
            .filter(|a| !a.is_terminal())
            .collect();

        for mut attempt in stale.iter().cloned() {
            warn!(
                "Attempt {} for {} was interrupted in state {}",
                attempt.id, attempt.service, attempt.state
            );
            let timer = StepTimer::start(StepKind::Recover);

            let detail = match (&attempt.new_instance, attempt.route_touched) {
                (Some(handle), false) => match self.runtime.remove(handle).await {
                    Ok(()) => format!("removed unrouted instance {handle}"),
                    Err(e) => format!("could not remove unrouted instance {handle}: {e}"),
                },
                (Some(handle), true) => self.reconcile_routed(&attempt, handle).await,
                (None, _) => "no instance was created".to_string(),
            };

            attempt.record_error(&OrchestratorError::Failed(format!(
                "interrupted in state {} by an orchestrator restart",
                attempt.state
            )));
            attempt.push_step(timer.ok(Some(detail)));
            attempt.apply(AttemptEvent::Fail)?;
            self.attempts.update(&attempt).await?;
        }

        if !stale.is_empty() {
            info!("Recovered {} interrupted attempts", stale.len());
        }
        Ok(stale.len())
    }

    /// Settle an interrupted attempt that had already switched the route.
    ///
    /// Traffic goes back to the previous instance when it is still running.
    /// Otherwise the new instance stays and becomes current.
    async fn reconcile_routed(&self, attempt: &DeploymentAttempt, handle: &InstanceHandle) -> String {
        let service = &attempt.service;
        let route = match self.router.current(service).await {
            Ok(route) => route,
            Err(e) => return format!("cannot read route ({e}); {handle} left in place"),
        };

        let Some(route) = route.filter(|r| &r.target == handle) else {
            return match self.runtime.remove(handle).await {
                Ok(()) => format!("removed unrouted instance {handle}"),
                Err(e) => format!("could not remove unrouted instance {handle}: {e}"),
            };
        };

        let previous = match &attempt.previous {
            Some(previous) => match self.runtime.inspect(&previous.handle).await {
                Ok(Some(running)) if running.running => Some(previous),
                Ok(Some(_)) => {
                    if let Err(e) = self.runtime.remove(&previous.handle).await {
                        warn!("Failed to remove stopped {}: {}", previous.handle, e);
                    }
                    None
                }
                Ok(None) => None,
                Err(e) => return format!("cannot inspect {} ({e}); {handle} left in place", previous.handle),
            },
            None => None,
        };

        let moved = match (previous, &attempt.previous) {
            (Some(previous), _) => self
                .router
                .register_route(service, &route.rule, route.port, &previous.handle)
                .await
                .map(|_| format!("route moved back to {}", previous.handle)),
            (None, Some(_)) => {
                // The previous instance is gone: keep serving from the new one
                let current = InstanceRef {
                    handle: handle.clone(),
                    version: attempt.version.clone(),
                    image: attempt.target.image.clone(),
                };
                return match self.registry.set_current(service, current).await {
                    Ok(()) => format!("previous instance gone; kept {handle} as current"),
                    Err(e) => format!("previous instance gone; could not record {handle}: {e}"),
                };
            }
            (None, None) => self
                .router
                .deregister_route(service)
                .await
                .map(|_| "route removed".to_string()),
        };

        match moved {
            Ok(detail) => match self.runtime.remove(handle).await {
                Ok(()) => format!("{detail}, removed {handle}"),
                Err(e) => format!("{detail}, could not remove {handle}: {e}"),
            },
            Err(e) => format!("could not move route off {handle}: {e}"),
        }
    }

    /// Cancel every in-flight attempt and wait up to `timeout` for them to
    /// settle. Returns how many are still running.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let ids: Vec<String> = {
            let cancels = self.cancels.lock().await;
            for tx in cancels.values() {
                tx.send_replace(true);
            }
            cancels.keys().cloned().collect()
        };
        if ids.is_empty() {
            return 0;
        }

        info!("Cancelling {} in-flight deployments", ids.len());
        let waits = join_all(ids.iter().map(|id| self.attempts.wait_terminal(id)));
        if tokio::time::timeout(timeout, waits).await.is_err() {
            warn!(
                "Deployments did not settle within {}",
                format_duration(timeout)
            );
        }

        let mut running = 0;
        for id in &ids {
            if let Some(attempt) = self.attempts.get(id).await {
                if !attempt.is_terminal() {
                    running += 1;
                }
            }
        }
        running
    }

    async fn dependency_committed(&self, dependency: &str) -> bool {
        match self.attempts.latest_for(dependency).await {
            Some(attempt) => attempt.state == AttemptState::Committed,
            None => self
                .registry
                .get(dependency)
                .await
                .map(|e| e.current.is_some())
                .unwrap_or(false),
        }
    }
}

pub(crate) fn build_status(
    entry: RegistryEntry,
    latest: Option<DeploymentAttempt>,
    route: Option<RouteRegistration>,
) -> ServiceStatus {
    let in_progress = latest.as_ref().map(|a| !a.is_terminal()).unwrap_or(false);
    ServiceStatus {
        service: entry.spec.name,
        image: entry.spec.image,
        current: entry.current,
        route,
        latest,
        in_progress,
    }
}

/// Resolves once cancellation is requested
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        // Sender gone: the attempt can no longer be cancelled
        std::future::pending::<()>().await;
    }
}

/// A single attempt being driven to a terminal state
struct AttemptRun {
    ctl: Arc<DeploymentController>,
    attempt: DeploymentAttempt,
    cancel: watch::Receiver<bool>,
    previous_route: Option<RouteRegistration>,
}

impl AttemptRun {
    async fn execute(mut self) {
        if let Err(e) = self.wait_dependencies().await {
            self.attempt.record_error(&e);
            let event = match e {
                OrchestratorError::Cancelled => AttemptEvent::Abort,
                _ => AttemptEvent::Fail,
            };
            self.advance(event).await;
            if self.attempt.state == AttemptState::RollingBack {
                self.roll_back().await;
            }
            return self.finish();
        }
        self.advance(AttemptEvent::DependenciesReady).await;

        let handle = match self.provision().await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Provisioning {} failed: {}", self.attempt.service, e);
                self.attempt.record_error(&e);
                self.remove_new().await;
                let event = if self.attempt.previous.is_some() {
                    AttemptEvent::ProvisionFailed
                } else {
                    AttemptEvent::Fail
                };
                self.advance(event).await;
                return self.finish();
            }
        };

        if self.cancelled() {
            return self.abort(OrchestratorError::Cancelled).await;
        }
        self.advance(AttemptEvent::Provisioned).await;

        if let Err(e) = self.health_check(&handle).await {
            return self.abort(e).await;
        }
        self.advance(AttemptEvent::Healthy).await;

        if self.cancelled() {
            return self.abort(OrchestratorError::Cancelled).await;
        }
        if let Err(e) = self.cutover(&handle).await {
            return self.abort(e).await;
        }
        self.advance(AttemptEvent::CutOver).await;

        // Cancellation after cutover takes effect once the drain grace is over
        self.drain().await;
        if self.cancelled() {
            return self.abort(OrchestratorError::Cancelled).await;
        }

        self.commit(&handle).await;
        self.advance(AttemptEvent::Drained).await;
        self.finish()
    }

    fn cancelled(&mut self) -> bool {
        let cancelled = *self.cancel.borrow();
        if cancelled && !self.attempt.cancel_requested {
            self.attempt.cancel_requested = true;
        }
        cancelled
    }

    /// Sleep for `duration`; returns true if cancellation arrived meanwhile
    async fn sleep_or_cancel(&mut self, duration: Duration) -> bool {
        if self.cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancellation(&mut self.cancel) => {}
        }
        self.cancelled()
    }

    async fn save(&self) {
        if let Err(e) = self.ctl.attempts.update(&self.attempt).await {
            error!("Failed to persist attempt {}: {}", self.attempt.id, e);
        }
    }

    async fn advance(&mut self, event: AttemptEvent) {
        let from = self.attempt.state;
        match self.attempt.apply(event) {
            Ok(to) => info!(
                "{} attempt {}: {} -> {}",
                self.attempt.service, self.attempt.id, from, to
            ),
            Err(e) => {
                error!("Attempt {}: {}", self.attempt.id, e);
                self.attempt.record_error(&e);
                if !self.attempt.is_terminal() {
                    let _ = self.attempt.apply(AttemptEvent::Fail);
                }
            }
        }
        self.save().await;
    }

    async fn abort(mut self, err: OrchestratorError) {
        warn!(
            "Aborting {} attempt {}: {}",
            self.attempt.service, self.attempt.id, err
        );
        self.attempt.record_error(&err);
        self.advance(AttemptEvent::Abort).await;
        self.roll_back().await;
        self.finish()
    }

    fn finish(self) {
        let attempt = &self.attempt;
        match attempt.state {
            AttemptState::Committed => info!(
                "Deployed {} {} (attempt {})",
                attempt.service, attempt.version, attempt.id
            ),
            state => warn!(
                "Deployment of {} {} ended {}: {}",
                attempt.service,
                attempt.version,
                state,
                attempt
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("no error recorded")
            ),
        }
    }

    /// Run `fut` as one recorded step
    async fn step<T, F>(&mut self, kind: StepKind, fut: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        let timer = StepTimer::start(kind);
        let result = fut.await;
        match &result {
            Ok(_) => self.attempt.push_step(timer.ok(None)),
            Err(e) => self.attempt.push_step(timer.failed(e.to_string())),
        }
        result
    }

    // ------------------------------------------------------------------ //

    async fn wait_dependencies(&mut self) -> Result<(), OrchestratorError> {
        let deps = self.attempt.target.depends_on.clone();
        if deps.is_empty() {
            return Ok(());
        }

        let ctl = self.ctl.clone();
        let timer = StepTimer::start(StepKind::WaitDependencies);
        let deadline = Instant::now() + ctl.options.dependency_timeout;
        let mut changes = ctl.attempts.subscribe();

        enum Wake {
            Timeout,
            Changed,
            Cancelled,
        }

        loop {
            let mut waiting_on = None;
            for dep in &deps {
                if !ctl.dependency_committed(dep).await {
                    waiting_on = Some(dep.clone());
                    break;
                }
            }

            let Some(dependency) = waiting_on else {
                self.attempt
                    .push_step(timer.ok(Some(format!("committed: {}", deps.join(", ")))));
                return Ok(());
            };

            if self.cancelled() {
                self.attempt.push_step(timer.failed("cancelled"));
                return Err(OrchestratorError::Cancelled);
            }

            debug!("{} waiting for {}", self.attempt.service, dependency);
            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Wake::Timeout,
                res = changes.changed() => if res.is_ok() { Wake::Changed } else { Wake::Timeout },
                _ = cancellation(&mut self.cancel) => Wake::Cancelled,
            };

            match wake {
                Wake::Changed | Wake::Cancelled => continue,
                Wake::Timeout => {
                    let err = OrchestratorError::DependencyTimeout {
                        service: self.attempt.service.clone(),
                        dependency,
                    };
                    self.attempt.push_step(timer.failed(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    async fn provision(&mut self) -> Result<InstanceHandle, OrchestratorError> {
        let ctl = self.ctl.clone();
        let spec = self.attempt.target.clone();

        let timer = StepTimer::start(StepKind::LoadSecrets);
        let secrets = match ctl.secrets.load(&spec.name, spec.optional_secrets).await {
            Ok(bundle) => {
                self.attempt
                    .push_step(timer.ok(Some(format!("{} keys", bundle.len()))));
                bundle
            }
            Err(e) => {
                self.attempt.push_step(timer.failed(e.to_string()));
                return Err(e);
            }
        };

        let name = instance_name(&spec.name, &self.attempt.version, &self.attempt.id);
        self.attempt.new_instance = Some(InstanceHandle::new(&name));
        self.save().await;

        let handle = self
            .step(StepKind::CreateInstance, ctl.runtime.create(&spec, &secrets, &name))
            .await?;
        drop(secrets);

        for network in spec.networks.iter().skip(1) {
            self.step(StepKind::AttachNetwork, ctl.runtime.attach_network(&handle, network))
                .await?;
        }
        self.step(StepKind::StartInstance, ctl.runtime.start(&handle)).await?;
        self.save().await;

        info!("Started {} for {}", handle, spec.name);
        Ok(handle)
    }

    async fn health_check(&mut self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        let ctl = self.ctl.clone();
        let spec = self.attempt.target.clone();
        let hc = &spec.health_check;

        if let Some(start_period) = hc.start_period {
            debug!("Waiting {} before probing {}", format_duration(start_period), handle);
            if self.sleep_or_cancel(start_period).await {
                return Err(OrchestratorError::Cancelled);
            }
        }

        let mut last = String::from("no probe completed");
        for n in 1..=hc.retries {
            if self.cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let timer = StepTimer::start(StepKind::Probe);
            let status =
                match tokio::time::timeout(hc.timeout, ctl.runtime.probe_health(handle, &spec)).await {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
                    Err(_) => HealthStatus::Unhealthy(format!(
                        "probe timed out after {}",
                        format_duration(hc.timeout)
                    )),
                };

            match status {
                HealthStatus::Healthy => {
                    self.attempt
                        .push_step(timer.ok(Some(format!("probe {}/{} healthy", n, hc.retries))));
                    self.save().await;
                    return Ok(());
                }
                HealthStatus::Unhealthy(reason) => last = reason,
                HealthStatus::Unknown => last = "health unknown".to_string(),
            }

            debug!("{} probe {}/{}: {}", handle, n, hc.retries, last);
            self.attempt
                .push_step(timer.failed(format!("probe {}/{}: {}", n, hc.retries, last)));
            self.save().await;

            if n < hc.retries && self.sleep_or_cancel(hc.interval).await {
                return Err(OrchestratorError::Cancelled);
            }
        }

        Err(OrchestratorError::HealthCheckExhausted {
            probes: hc.retries,
            last,
        })
    }

    async fn cutover(&mut self, handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        let ctl = self.ctl.clone();
        let spec = self.attempt.target.clone();
        let timer = StepTimer::start(StepKind::Cutover);

        let Some(rule) = spec.route.clone() else {
            self.attempt.push_step(timer.ok(Some("no route declared".to_string())));
            return Ok(());
        };

        let lookup = ctl.router.current(&spec.name);
        let previous_route = match tokio::time::timeout(ctl.options.router_timeout, lookup).await {
            Ok(Ok(route)) => route,
            Ok(Err(e)) => {
                let msg = format!("cannot read current route: {e}");
                return self.cutover_failed(timer, msg).await;
            }
            Err(_) => {
                let msg = format!(
                    "router did not respond within {}",
                    format_duration(ctl.options.router_timeout)
                );
                return self.cutover_failed(timer, msg).await;
            }
        };
        self.previous_route = previous_route.clone();

        let switch = async {
            match &previous_route {
                Some(route) if route.rule == rule && route.port == spec.port => {
                    ctl.router.swap_target(&spec.name, handle).await.map(|_| ())
                }
                _ => ctl
                    .router
                    .register_route(&spec.name, &rule, spec.port, handle)
                    .await
                    .map(|_| ()),
            }
        };

        let result = match tokio::time::timeout(ctl.options.router_timeout, switch).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OrchestratorError::CutoverFailed(e.to_string())),
            Err(_) => Err(OrchestratorError::CutoverFailed(format!(
                "router did not respond within {}",
                format_duration(ctl.options.router_timeout)
            ))),
        };

        match result {
            Ok(()) => {
                self.attempt.route_touched = true;
                self.attempt
                    .push_step(timer.ok(Some(format!("{} -> {}", rule.host, handle))));
                self.save().await;
                Ok(())
            }
            Err(e) => {
                // The write may have landed even though the call failed
                if let Ok(Some(route)) = ctl.router.current(&spec.name).await {
                    if &route.target == handle {
                        self.attempt.route_touched = true;
                    }
                }
                self.attempt.push_step(timer.failed(e.to_string()));
                self.save().await;
                Err(e)
            }
        }
    }

    /// Fail cutover before anything was written to the router
    async fn cutover_failed(&mut self, timer: StepTimer, msg: String) -> Result<(), OrchestratorError> {
        let err = OrchestratorError::CutoverFailed(msg);
        self.attempt.push_step(timer.failed(err.to_string()));
        self.save().await;
        Err(err)
    }

    async fn drain(&mut self) {
        let grace = self.ctl.options.drain_grace;
        let timer = StepTimer::start(StepKind::Drain);
        tokio::time::sleep(grace).await;
        self.attempt
            .push_step(timer.ok(Some(format!("waited {}", format_duration(grace)))));
        self.save().await;
    }

    async fn commit(&mut self, handle: &InstanceHandle) {
        let ctl = self.ctl.clone();

        if let Some(previous) = self.attempt.previous.clone() {
            let grace = self.attempt.target.stop_grace;
            if let Err(e) = self
                .step(StepKind::StopPrevious, ctl.runtime.stop(&previous.handle, grace))
                .await
            {
                warn!("Failed to stop {}: {}", previous.handle, e);
            }
            self.remove_previous(&previous.handle).await;
        }

        let service = self.attempt.service.clone();
        let current = InstanceRef {
            handle: handle.clone(),
            version: self.attempt.version.clone(),
            image: self.attempt.target.image.clone(),
        };
        if let Err(e) = self
            .step(StepKind::CommitRegistry, ctl.registry.set_current(&service, current))
            .await
        {
            error!("Failed to record {} as current: {}", handle, e);
        }
    }

    /// Remove the previous instance, retrying with backoff
    async fn remove_previous(&mut self, previous: &InstanceHandle) {
        let ctl = self.ctl.clone();
        let retries = ctl.options.removal_retries.max(1);
        let timer = StepTimer::start(StepKind::RemovePrevious);

        for n in 0..retries {
            match ctl.runtime.remove(previous).await {
                Ok(()) => {
                    self.attempt
                        .push_step(timer.ok(Some(format!("removed {previous}"))));
                    return;
                }
                Err(e) if n + 1 < retries => {
                    let delay = calc_exp_backoff(&ctl.options.removal_backoff, n);
                    warn!(
                        "Removing {} failed ({}), retrying in {}",
                        previous,
                        e,
                        format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("Giving up removing {} after {} tries: {}", previous, retries, e);
                    self.attempt.push_step(timer.failed(format!(
                        "{} still present after {} tries: {}",
                        previous, retries, e
                    )));
                    return;
                }
            }
        }
    }

    /// Best-effort removal of the new instance
    async fn remove_new(&mut self) -> bool {
        let Some(handle) = self.attempt.new_instance.clone() else {
            return true;
        };
        let ctl = self.ctl.clone();
        match self.step(StepKind::RemoveNew, ctl.runtime.remove(&handle)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove {}: {}", handle, e);
                false
            }
        }
    }

    /// Undo the attempt from `RollingBack`
    async fn roll_back(&mut self) {
        let ctl = self.ctl.clone();
        let service = self.attempt.service.clone();
        let mut restored = true;

        if self.attempt.route_touched {
            // Route back to the previous instance, rebuilding the route when
            // the one it had could not be read before cutover
            let rule = self
                .previous_route
                .as_ref()
                .map(|r| (r.rule.clone(), r.port))
                .or_else(|| self.attempt.target.route.clone().map(|r| (r, self.attempt.target.port)));
            let restore = async {
                match (&self.attempt.previous, rule) {
                    (Some(previous), Some((rule, port))) => ctl
                        .router
                        .register_route(&service, &rule, port, &previous.handle)
                        .await
                        .map(|_| ()),
                    (Some(previous), None) => Err(OrchestratorError::Internal(format!(
                        "no route known to restore for {}",
                        previous.handle
                    ))),
                    (None, _) => ctl.router.deregister_route(&service).await,
                }
            };
            let result = match tokio::time::timeout(ctl.options.router_timeout, restore).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::RouterUnreachable(format!(
                    "router did not respond within {}",
                    format_duration(ctl.options.router_timeout)
                ))),
            };

            let timer = StepTimer::start(StepKind::RestoreRoute);
            match result {
                Ok(()) => self.attempt.push_step(timer.ok(None)),
                Err(e) => {
                    error!("Failed to restore route of {}: {}", service, e);
                    self.attempt.record_error(&e);
                    self.attempt.push_step(timer.failed(e.to_string()));
                    restored = false;
                }
            }
        }

        // Keep the new instance if traffic may still reach it
        if restored {
            self.remove_new().await;
        }

        let Some(previous) = self.attempt.previous.clone() else {
            self.advance(AttemptEvent::Fail).await;
            return;
        };

        if restored {
            let spec = self.attempt.target.with_version(&previous.version);
            let timeout = spec.health_check.timeout;
            let timer = StepTimer::start(StepKind::VerifyPrevious);
            let status =
                match tokio::time::timeout(timeout, ctl.runtime.probe_health(&previous.handle, &spec))
                    .await
                {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
                    Err(_) => HealthStatus::Unhealthy("probe timed out".to_string()),
                };

            if status.is_healthy() {
                self.attempt
                    .push_step(timer.ok(Some(format!("{} healthy", previous.handle))));
            } else {
                let reason = match status {
                    HealthStatus::Unhealthy(reason) => reason,
                    _ => "health unknown".to_string(),
                };
                self.attempt.record_error(&OrchestratorError::Failed(format!(
                    "previous instance {} is not healthy: {}",
                    previous.handle, reason
                )));
                self.attempt.push_step(timer.failed(reason));
                restored = false;
            }
        }

        let event = if restored {
            AttemptEvent::RollbackComplete
        } else {
            AttemptEvent::Fail
        };
        self.advance(event).await;
    }
}
