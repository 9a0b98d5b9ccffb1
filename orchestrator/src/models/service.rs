//! Service declaration models

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{serde_duration, serde_duration_opt};

/// A declared service: what should run, where, and how it is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,

    /// Desired image (repository + tag or digest)
    pub image: ImageRef,

    /// Networks to join; the first one is the primary network
    #[serde(default)]
    pub networks: Vec<String>,

    /// Public routing rule; internal services have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteRule>,

    /// Container port the service listens on
    pub port: u16,

    /// Services that must be committed before this one deploys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Readiness probe definition
    #[serde(default)]
    pub health_check: HealthCheckSpec,

    /// Grace period given to the container on stop
    #[serde(default = "default_stop_grace", with = "serde_duration")]
    pub stop_grace: Duration,

    /// Deploy without a secrets file instead of failing
    #[serde(default)]
    pub optional_secrets: bool,
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

impl ServiceSpec {
    /// Snapshot of this spec pinned to another image version
    pub fn with_version(&self, version: &str) -> Self {
        let mut spec = self.clone();
        spec.image = self.image.with_version(version);
        spec
    }

    /// The network used to reach the container
    pub fn primary_network(&self) -> Option<&str> {
        self.networks.first().map(String::as_str)
    }
}

/// Reverse-proxy routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Public hostname
    pub host: String,

    /// Proxy entrypoint (e.g. `websecure`)
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    /// TLS certificate resolver name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_resolver: Option<String>,
}

fn default_entrypoint() -> String {
    "websecure".to_string()
}

/// Health check definition.
///
/// `http` probes the container's primary network address; `command` runs
/// inside the container. With neither set, a running container is healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default = "default_interval", with = "serde_duration")]
    pub interval: Duration,

    #[serde(default = "default_timeout", with = "serde_duration")]
    pub timeout: Duration,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(
        default,
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_period: Option<Duration>,
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_retries() -> u32 {
    10
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            http: None,
            command: None,
            interval: default_interval(),
            timeout: default_timeout(),
            retries: default_retries(),
            start_period: None,
        }
    }
}

/// How an instance is probed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<'a> {
    Http(&'a str),
    Command(&'a [String]),
    Running,
}

impl HealthCheckSpec {
    pub fn probe(&self) -> Probe<'_> {
        match (&self.http, &self.command) {
            (Some(path), _) => Probe::Http(path),
            (None, Some(cmd)) => Probe::Command(cmd),
            (None, None) => Probe::Running,
        }
    }
}

/// Image reference: repository plus tag or digest.
///
/// Serialized as a single string, `repo:tag` or `repo@sha256:...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub repository: String,
    pub reference: ImageReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    Tag(String),
    Digest(String),
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("Image reference is empty".to_string());
        }

        if let Some((repository, digest)) = raw.split_once('@') {
            if repository.is_empty() || digest.is_empty() {
                return Err(format!("Invalid image reference: {raw}"));
            }
            return Ok(Self {
                repository: repository.to_string(),
                reference: ImageReference::Digest(digest.to_string()),
            });
        }

        // A colon before the last slash belongs to a registry port
        let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        match raw[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let (repository, tag) = (&raw[..split], &raw[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(format!("Invalid image reference: {raw}"));
                }
                Ok(Self {
                    repository: repository.to_string(),
                    reference: ImageReference::Tag(tag.to_string()),
                })
            }
            None => Ok(Self {
                repository: raw.to_string(),
                reference: ImageReference::Tag("latest".to_string()),
            }),
        }
    }

    /// Same repository at another version; `sha256:` versions become digests
    pub fn with_version(&self, version: &str) -> Self {
        let reference = if version.starts_with("sha256:") {
            ImageReference::Digest(version.to_string())
        } else {
            ImageReference::Tag(version.to_string())
        };
        Self {
            repository: self.repository.clone(),
            reference,
        }
    }

    /// Tag or digest, as given to `deploy`
    pub fn version(&self) -> &str {
        match &self.reference {
            ImageReference::Tag(t) => t,
            ImageReference::Digest(d) => d,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            ImageReference::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            ImageReference::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

impl TryFrom<String> for ImageRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ImageRef::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}

/// Declaration document: one entry per service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDeclarations {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parse() {
        let image = ImageRef::parse("ghcr.io/acme/api:1.4.0").unwrap();
        assert_eq!(image.repository, "ghcr.io/acme/api");
        assert_eq!(image.reference, ImageReference::Tag("1.4.0".to_string()));

        let image = ImageRef::parse("localhost:5000/api").unwrap();
        assert_eq!(image.repository, "localhost:5000/api");
        assert_eq!(image.version(), "latest");

        let image = ImageRef::parse("postgres@sha256:abcd").unwrap();
        assert_eq!(image.reference, ImageReference::Digest("sha256:abcd".to_string()));
        assert_eq!(image.to_string(), "postgres@sha256:abcd");

        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("api:").is_err());
    }

    #[test]
    fn test_image_ref_with_version() {
        let image = ImageRef::parse("ghcr.io/acme/api:v1").unwrap();
        assert_eq!(image.with_version("v2").to_string(), "ghcr.io/acme/api:v2");
        assert_eq!(
            image.with_version("sha256:beef").to_string(),
            "ghcr.io/acme/api@sha256:beef"
        );
    }

    #[test]
    fn test_declarations_from_yaml() {
        let yaml = r#"
services:
  - name: db
    image: postgres:16
    networks: [internal]
    port: 5432
    health_check:
      command: ["pg_isready", "-U", "postgres"]
      interval: 2s
      retries: 15
  - name: api
    image: ghcr.io/acme/api:1.0.0
    networks: [web, internal]
    port: 8080
    depends_on: [db]
    route:
      host: api.example.com
      tls_resolver: letsencrypt
    health_check:
      http: /healthz
      timeout: 500ms
      start_period: 3s
"#;
        let decls: ServiceDeclarations = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decls.services.len(), 2);

        let db = &decls.services[0];
        assert!(db.route.is_none());
        assert_eq!(db.health_check.interval, Duration::from_secs(2));
        assert_eq!(db.health_check.timeout, Duration::from_secs(3));
        assert!(matches!(db.health_check.probe(), Probe::Command(_)));
        assert_eq!(db.stop_grace, Duration::from_secs(10));

        let api = &decls.services[1];
        let route = api.route.as_ref().unwrap();
        assert_eq!(route.entrypoint, "websecure");
        assert_eq!(route.tls_resolver.as_deref(), Some("letsencrypt"));
        assert_eq!(api.primary_network(), Some("web"));
        assert_eq!(api.health_check.probe(), Probe::Http("/healthz"));
        assert_eq!(api.health_check.timeout, Duration::from_millis(500));
        assert_eq!(api.health_check.start_period, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_spec_json_round_trip() {
        let yaml = r#"
name: web
image: nginx:1.27
networks: [web]
port: 80
health_check:
  interval: 250ms
"#;
        let spec: ServiceSpec = serde_yaml::from_str(yaml).unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        let back: ServiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
