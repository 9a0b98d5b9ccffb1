//! Traefik file-provider router
//!
//! Each routed service owns `<dynamic_dir>/<service>.yml` holding a single
//! router and a single-server load balancer. Traefik watches the directory
//! and reloads on change; files are replaced with a rename so the proxy
//! never reads a partial config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::instance::{InstanceHandle, RouteRegistration};
use crate::models::service::RouteRule;
use crate::router::Router;

/// Traefik adapter settings
#[derive(Debug, Clone)]
pub struct TraefikOptions {
    /// Directory watched by Traefik's file provider
    pub dynamic_dir: PathBuf,

    /// Traefik API base URL, pinged when set
    pub api_url: Option<String>,

    /// Timeout for API pings
    pub timeout: Duration,
}

pub struct TraefikFileRouter {
    dir: Dir,
    api_url: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
    routes: Mutex<BTreeMap<String, RouteRegistration>>,
}

impl TraefikFileRouter {
    /// Open the dynamic config directory and rebuild the route table from
    /// the files already in it
    pub async fn open(options: TraefikOptions) -> Result<Self, OrchestratorError> {
        let dir = Dir::new(&options.dynamic_dir);
        if !dir.exists().await {
            return Err(OrchestratorError::RouterUnreachable(format!(
                "{} does not exist",
                dir.path().display()
            )));
        }

        let files = dir
            .list_files_with_ext("yml")
            .await
            .map_err(|e| unreachable_at(dir.path(), e))?;

        let mut routes = BTreeMap::new();
        for path in files {
            let Some(service) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let raw = File::new(&path)
                .read_string()
                .await
                .map_err(|e| unreachable_at(&path, e))?;

            match parse_registration(&service, &raw) {
                Some(registration) => {
                    debug!("Found route {} -> {}", registration.rule.host, registration.target);
                    routes.insert(service, registration);
                }
                None => warn!("Ignoring unrecognised dynamic config {}", path.display()),
            }
        }

        info!(
            "Loaded {} routes from {}",
            routes.len(),
            dir.path().display()
        );

        Ok(Self {
            dir,
            api_url: options.api_url,
            timeout: options.timeout,
            http: reqwest::Client::new(),
            routes: Mutex::new(routes),
        })
    }

    fn file_for(&self, service: &str) -> File {
        self.dir.file(&format!("{service}.yml"))
    }

    async fn write(&self, registration: &RouteRegistration) -> Result<(), OrchestratorError> {
        let file = self.file_for(&registration.service);
        let contents = render(registration)?;
        file.write_atomic(contents.as_bytes())
            .await
            .map_err(|e| unreachable_at(file.path(), e))
    }
}

fn unreachable_at(path: &Path, err: OrchestratorError) -> OrchestratorError {
    OrchestratorError::RouterUnreachable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl Router for TraefikFileRouter {
    async fn register_route(
        &self,
        service: &str,
        rule: &RouteRule,
        port: u16,
        target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError> {
        let mut routes = self.routes.lock().await;

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
        self.write(&registration).await?;
        routes.insert(service.to_string(), registration.clone());

        info!("Routed {} to {}:{}", rule.host, target, port);
        Ok(registration)
    }

    async fn deregister_route(&self, service: &str) -> Result<(), OrchestratorError> {
        let mut routes = self.routes.lock().await;
        let file = self.file_for(service);
        file.delete().await.map_err(|e| unreachable_at(file.path(), e))?;

        if let Some(removed) = routes.remove(service) {
            info!("Removed route for {}", removed.rule.host);
        }
        Ok(())
    }

    async fn swap_target(
        &self,
        service: &str,
        new_target: &InstanceHandle,
    ) -> Result<RouteRegistration, OrchestratorError> {
        let mut routes = self.routes.lock().await;
        let previous = routes
            .get(service)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("route for {service}")))?;

        let mut next = previous.clone();
        next.target = new_target.clone();
        self.write(&next).await?;
        routes.insert(service.to_string(), next);

        info!(
            "Switched {} from {} to {}",
            previous.rule.host, previous.target, new_target
        );
        Ok(previous)
    }

    /// Reads the service's file, so a write whose caller was dropped still shows
    async fn current(&self, service: &str) -> Result<Option<RouteRegistration>, OrchestratorError> {
        let mut routes = self.routes.lock().await;
        let file = self.file_for(service);

        let registration = if file.exists().await {
            let raw = file
                .read_string()
                .await
                .map_err(|e| unreachable_at(file.path(), e))?;
            parse_registration(service, &raw)
        } else {
            None
        };

        match &registration {
            Some(r) => routes.insert(service.to_string(), r.clone()),
            None => routes.remove(service),
        };
        Ok(registration)
    }

    async fn ping(&self) -> Result<(), OrchestratorError> {
        if !self.dir.exists().await {
            return Err(OrchestratorError::RouterUnreachable(format!(
                "{} does not exist",
                self.dir.path().display()
            )));
        }

        if let Some(api_url) = &self.api_url {
            let url = format!("{}/api/overview", api_url.trim_end_matches('/'));
            let resp = self
                .http
                .get(&url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| OrchestratorError::RouterUnreachable(format!("{url}: {e}")))?;
            if !resp.status().is_success() {
                return Err(OrchestratorError::RouterUnreachable(format!(
                    "{} returned {}",
                    url,
                    resp.status()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DynamicConfig {
    http: HttpSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpSection {
    #[serde(default)]
    routers: BTreeMap<String, RouterSection>,
    #[serde(default)]
    services: BTreeMap<String, ServiceSection>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterSection {
    rule: String,
    entry_points: Vec<String>,
    service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls: Option<TlsSection>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cert_resolver: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSection {
    load_balancer: LoadBalancerSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadBalancerSection {
    servers: Vec<ServerSection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerSection {
    url: String,
}

/// Render the dynamic config for one registration
fn render(registration: &RouteRegistration) -> Result<String, OrchestratorError> {
    let name = registration.service.clone();
    let rule = &registration.rule;

    let router = RouterSection {
        rule: format!("Host(`{}`)", rule.host),
        entry_points: vec![rule.entrypoint.clone()],
        service: name.clone(),
        tls: rule.tls_resolver.as_ref().map(|resolver| TlsSection {
            cert_resolver: Some(resolver.clone()),
        }),
    };
    let service = ServiceSection {
        load_balancer: LoadBalancerSection {
            servers: vec![ServerSection {
                url: format!("http://{}:{}", registration.target, registration.port),
            }],
        },
    };

    let config = DynamicConfig {
        http: HttpSection {
            routers: BTreeMap::from([(name.clone(), router)]),
            services: BTreeMap::from([(name, service)]),
        },
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// Recover a registration from a file written by `render`
fn parse_registration(service: &str, raw: &str) -> Option<RouteRegistration> {
    let config: DynamicConfig = serde_yaml::from_str(raw).ok()?;
    let router = config.http.routers.get(service)?;
    let backend = config.http.services.get(&router.service)?;
    let server = backend.load_balancer.servers.first()?;

    let host = router
        .rule
        .strip_prefix("Host(`")?
        .strip_suffix("`)")?
        .to_string();
    let (target, port) = server.url.strip_prefix("http://")?.rsplit_once(':')?;

    Some(RouteRegistration {
        service: service.to_string(),
        rule: RouteRule {
            host,
            entrypoint: router.entry_points.first()?.clone(),
            tls_resolver: router.tls.as_ref().and_then(|t| t.cert_resolver.clone()),
        },
        port: port.parse().ok()?,
        target: InstanceHandle::new(target),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> RouteRegistration {
        RouteRegistration {
            service: "api".into(),
            rule: RouteRule {
                host: "api.example.com".into(),
                entrypoint: "websecure".into(),
                tls_resolver: Some("letsencrypt".into()),
            },
            port: 8080,
            target: InstanceHandle::new("api-v2-0f3c9a2e"),
        }
    }

    #[test]
    fn test_render_shape() {
        let yaml = render(&registration()).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let router = &value["http"]["routers"]["api"];
        assert_eq!(router["rule"].as_str(), Some("Host(`api.example.com`)"));
        assert_eq!(router["entryPoints"][0].as_str(), Some("websecure"));
        assert_eq!(router["tls"]["certResolver"].as_str(), Some("letsencrypt"));

        let servers = &value["http"]["services"]["api"]["loadBalancer"]["servers"];
        assert_eq!(servers.as_sequence().map(|s| s.len()), Some(1));
        assert_eq!(servers[0]["url"].as_str(), Some("http://api-v2-0f3c9a2e:8080"));
    }

    #[test]
    fn test_parse_rendered_file() {
        let original = registration();
        let yaml = render(&original).unwrap();
        assert_eq!(parse_registration("api", &yaml), Some(original));
    }

    #[test]
    fn test_parse_ignores_foreign_files() {
        let foreign = "http:\n  middlewares:\n    redirect:\n      redirectScheme:\n        scheme: https\n";
        assert_eq!(parse_registration("redirect", foreign), None);
        assert_eq!(parse_registration("api", "not: [valid"), None);
    }
}
