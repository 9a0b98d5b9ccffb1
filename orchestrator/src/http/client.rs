//! HTTP client for the orchestrator API

use reqwest::{header, Client, Method, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::{ErrorKind, OrchestratorError};
use crate::models::attempt::DeploymentAttempt;
use crate::models::service::ServiceDeclarations;
use crate::models::status::ServiceStatus;
use crate::registry::RegistryEntry;
use crate::server::error::ErrorBody;
use crate::server::handlers::{ApplyResponse, DeployRequest, HealthResponse};

/// Client used by the CLI to talk to a running daemon
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, OrchestratorError> {
        // No overall timeout: waiting on a deployment can take minutes
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, OrchestratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = &self.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        error!("HTTP {} {} failed: {}", method, path, status);

        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(OrchestratorError::Api {
                kind: body.kind,
                message: body.message,
            }),
            Err(_) => Err(OrchestratorError::Api {
                kind: ErrorKind::Internal,
                message: format!("{}: {}", status, text),
            }),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, OrchestratorError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, OrchestratorError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> Result<HealthResponse, OrchestratorError> {
        self.get("/health").await
    }

    pub async fn apply(&self, decls: &ServiceDeclarations) -> Result<Vec<String>, OrchestratorError> {
        let resp: ApplyResponse = self.post("/services", decls).await?;
        Ok(resp.registered)
    }

    pub async fn services(&self) -> Result<Vec<RegistryEntry>, OrchestratorError> {
        self.get("/services").await
    }

    pub async fn remove(&self, service: &str) -> Result<RegistryEntry, OrchestratorError> {
        let response = self
            .send::<()>(Method::DELETE, &format!("/services/{service}"), None)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn deploy(&self, service: &str, version: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        let req = DeployRequest {
            service: service.to_string(),
            version: version.to_string(),
        };
        self.post("/deployments", &req).await
    }

    pub async fn attempt(&self, id: &str, wait: bool) -> Result<DeploymentAttempt, OrchestratorError> {
        let path = if wait {
            format!("/deployments/{id}?wait=true")
        } else {
            format!("/deployments/{id}")
        };
        self.get(&path).await
    }

    pub async fn rollback(&self, service: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        self.post(&format!("/services/{service}/rollback"), &()).await
    }

    pub async fn status(&self, service: Option<&str>) -> Result<Vec<ServiceStatus>, OrchestratorError> {
        match service {
            Some(name) => self.get(&format!("/status?service={name}")).await,
            None => self.get("/status").await,
        }
    }
}
