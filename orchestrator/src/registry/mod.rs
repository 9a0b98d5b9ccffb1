//! Service registry
//!
//! Holds the declared services and the "current version" pointer of each.
//! Every mutation is validated against the whole graph and persisted before
//! it becomes visible, so a restarted process sees the same desired state.

pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::instance::InstanceRef;
use crate::models::service::{ServiceDeclarations, ServiceSpec};

use self::validate::{validate_graph, validate_spec};

/// A registered service and its committed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub spec: ServiceSpec,

    /// Instance committed by the last successful deployment
    #[serde(default)]
    pub current: Option<InstanceRef>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    services: BTreeMap<String, RegistryEntry>,
}

/// Durable, lock-protected registry of declared services
pub struct ServiceRegistry {
    file: File,
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl ServiceRegistry {
    /// Open the registry stored at `file`, starting empty if it does not exist
    pub async fn open(file: File) -> Result<Self, OrchestratorError> {
        let doc: RegistryDocument = file.read_json_or_default().await?;
        info!(
            "Loaded service registry from {} ({} services)",
            file.path().display(),
            doc.services.len()
        );

        Ok(Self {
            file,
            entries: RwLock::new(doc.services),
        })
    }

    /// Parse a YAML declaration document
    pub async fn load_declarations(file: &File) -> Result<Vec<ServiceSpec>, OrchestratorError> {
        let decls: ServiceDeclarations = file.read_yaml().await?;
        Ok(decls.services)
    }

    /// Register or replace a single service
    pub async fn register(&self, spec: ServiceSpec) -> Result<RegistryEntry, OrchestratorError> {
        let name = spec.name.clone();
        self.register_all(vec![spec]).await?;
        self.get(&name).await
    }

    /// Register or replace a batch of services, all or nothing.
    ///
    /// Dependencies may point at other services in the same batch. Existing
    /// `current` pointers are preserved.
    pub async fn register_all(&self, specs: Vec<ServiceSpec>) -> Result<Vec<String>, OrchestratorError> {
        for spec in &specs {
            validate_spec(spec)?;
        }

        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        let mut names = Vec::with_capacity(specs.len());

        for spec in specs {
            if names.contains(&spec.name) {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "{} is declared more than once",
                    spec.name
                )));
            }
            names.push(spec.name.clone());

            let current = next.get(&spec.name).and_then(|e| e.current.clone());
            next.insert(spec.name.clone(), RegistryEntry { spec, current });
        }

        let graph: BTreeMap<String, ServiceSpec> = next
            .iter()
            .map(|(name, entry)| (name.clone(), entry.spec.clone()))
            .collect();
        validate_graph(&graph)?;

        self.save(&next).await?;
        *entries = next;

        info!("Registered services: {}", names.join(", "));
        Ok(names)
    }

    /// Get a registered service
    pub async fn get(&self, name: &str) -> Result<RegistryEntry, OrchestratorError> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {name}")))
    }

    /// All registered services, sorted by name
    pub async fn list(&self) -> Vec<RegistryEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Remove a service that nothing depends on
    pub async fn remove(&self, name: &str) -> Result<RegistryEntry, OrchestratorError> {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(name) {
            return Err(OrchestratorError::NotFound(format!("service {name}")));
        }

        let dependents: Vec<String> = entries
            .values()
            .filter(|e| e.spec.depends_on.iter().any(|d| d == name))
            .map(|e| e.spec.name.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(OrchestratorError::InUse {
                service: name.to_string(),
                dependents,
            });
        }

        let mut next = entries.clone();
        let removed = next.remove(name);
        self.save(&next).await?;
        *entries = next;

        info!("Removed service {}", name);
        removed.ok_or_else(|| OrchestratorError::NotFound(format!("service {name}")))
    }

    /// Move the current-version pointer after a committed deployment
    pub async fn set_current(
        &self,
        name: &str,
        instance: InstanceRef,
    ) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();

        let entry = next
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {name}")))?;
        entry.spec.image = instance.image.clone();
        entry.current = Some(instance);

        self.save(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn save(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), OrchestratorError> {
        let doc = RegistryDocument {
            services: entries.clone(),
        };
        self.file.write_json(&doc).await?;
        debug!("Persisted registry ({} services)", entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::InstanceHandle;
    use crate::models::service::ImageRef;

    fn spec(name: &str, port: u16, deps: &[&str]) -> ServiceSpec {
        let mut spec: ServiceSpec = serde_yaml::from_str(&format!(
            "name: {name}\nimage: acme/{name}:1\nnetworks: [internal]\nport: {port}\n"
        ))
        .unwrap();
        spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
        spec
    }

    async fn open(dir: &tempfile::TempDir) -> ServiceRegistry {
        ServiceRegistry::open(File::new(dir.path().join("registry.json")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;

        let api = spec("api", 8080, &[]);
        registry.register(api.clone()).await.unwrap();
        assert_eq!(registry.get("api").await.unwrap().spec, api);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = open(&dir).await;
            registry
                .register_all(vec![spec("db", 5432, &[]), spec("api", 8080, &["db"])])
                .await
                .unwrap();
            registry
                .set_current(
                    "db",
                    InstanceRef {
                        handle: InstanceHandle::new("db-2-abcd1234"),
                        version: "2".into(),
                        image: ImageRef::parse("acme/db:2").unwrap(),
                    },
                )
                .await
                .unwrap();
        }

        let registry = open(&dir).await;
        let names: Vec<_> = registry.list().await.into_iter().map(|e| e.spec.name).collect();
        assert_eq!(names, vec!["api", "db"]);

        let db = registry.get("db").await.unwrap();
        assert_eq!(db.spec.image.to_string(), "acme/db:2");
        assert_eq!(db.current.unwrap().handle.as_str(), "db-2-abcd1234");
    }

    #[tokio::test]
    async fn test_invalid_batch_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        registry.register(spec("db", 5432, &[])).await.unwrap();

        let result = registry
            .register_all(vec![spec("api", 8080, &["cache"]), spec("web", 80, &[])])
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidSpec(_))));
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_keeps_current_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        registry.register(spec("api", 8080, &[])).await.unwrap();
        let current = InstanceRef {
            handle: InstanceHandle::new("api-1-0000aaaa"),
            version: "1".into(),
            image: ImageRef::parse("acme/api:1").unwrap(),
        };
        registry.set_current("api", current.clone()).await.unwrap();

        let mut updated = spec("api", 9090, &[]);
        updated.health_check.retries = 3;
        let entry = registry.register(updated).await.unwrap();
        assert_eq!(entry.spec.port, 9090);
        assert_eq!(entry.current, Some(current));
    }

    #[tokio::test]
    async fn test_remove_not_found_and_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        registry
            .register_all(vec![spec("db", 5432, &[]), spec("api", 8080, &["db"])])
            .await
            .unwrap();

        assert!(matches!(
            registry.remove("cache").await,
            Err(OrchestratorError::NotFound(_))
        ));
        match registry.remove("db").await {
            Err(OrchestratorError::InUse { dependents, .. }) => assert_eq!(dependents, vec!["api"]),
            other => panic!("expected InUse, got {other:?}"),
        }

        registry.remove("api").await.unwrap();
        registry.remove("db").await.unwrap();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_in_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        let result = registry
            .register_all(vec![spec("api", 8080, &[]), spec("api", 9090, &[])])
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidSpec(_))));
    }
}
