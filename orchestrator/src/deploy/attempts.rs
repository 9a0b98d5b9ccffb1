//! Durable attempt history

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::attempt::DeploymentAttempt;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttemptsDocument {
    #[serde(default)]
    attempts: Vec<DeploymentAttempt>,
}

/// Every known attempt, oldest first, persisted on each change.
///
/// Subscribers are woken through a watch channel whenever any attempt
/// changes, which is how dependency waits avoid polling.
pub struct AttemptBook {
    file: File,
    history_limit: usize,
    attempts: RwLock<Vec<DeploymentAttempt>>,
    changes: watch::Sender<u64>,
}

impl AttemptBook {
    pub async fn open(file: File, history_limit: usize) -> Result<Self, OrchestratorError> {
        let doc: AttemptsDocument = file.read_json_or_default().await?;
        debug!(
            "Loaded {} attempts from {}",
            doc.attempts.len(),
            file.path().display()
        );

        let (changes, _) = watch::channel(0);
        Ok(Self {
            file,
            history_limit: history_limit.max(1),
            attempts: RwLock::new(doc.attempts),
            changes,
        })
    }

    /// Receiver that observes every subsequent change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub async fn insert(&self, attempt: DeploymentAttempt) -> Result<(), OrchestratorError> {
        let mut attempts = self.attempts.write().await;
        attempts.push(attempt);
        self.commit(&mut attempts).await
    }

    /// Replace the stored copy of `attempt`
    pub async fn update(&self, attempt: &DeploymentAttempt) -> Result<(), OrchestratorError> {
        let mut attempts = self.attempts.write().await;
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(slot) => *slot = attempt.clone(),
            None => attempts.push(attempt.clone()),
        }
        self.commit(&mut attempts).await
    }

    pub async fn get(&self, id: &str) -> Option<DeploymentAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Most recently started attempt for `service`
    pub async fn latest_for(&self, service: &str) -> Option<DeploymentAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .rev()
            .find(|a| a.service == service)
            .cloned()
    }

    /// Non-terminal attempt for `service`, if any
    pub async fn in_progress_for(&self, service: &str) -> Option<DeploymentAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .rev()
            .find(|a| a.service == service && !a.is_terminal())
            .cloned()
    }

    /// Attempts, newest first, optionally for one service
    pub async fn list(&self, service: Option<&str>) -> Vec<DeploymentAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .rev()
            .filter(|a| service.map(|s| a.service == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Wait until attempt `id` reaches a terminal state
    pub async fn wait_terminal(&self, id: &str) -> Result<DeploymentAttempt, OrchestratorError> {
        let mut changes = self.subscribe();
        loop {
            match self.get(id).await {
                Some(attempt) if attempt.is_terminal() => return Ok(attempt),
                Some(_) => {}
                None => return Err(OrchestratorError::NotFound(format!("attempt {id}"))),
            }
            changes
                .changed()
                .await
                .map_err(|_| OrchestratorError::Internal("attempt book closed".to_string()))?;
        }
    }

    async fn commit(&self, attempts: &mut Vec<DeploymentAttempt>) -> Result<(), OrchestratorError> {
        prune(attempts, self.history_limit);
        let doc = AttemptsDocument {
            attempts: attempts.clone(),
        };
        let result = self.file.write_json(&doc).await;

        // Wake waiters even when persisting failed; memory is authoritative
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
        result
    }
}

/// Keep at most `limit` terminal attempts per service; never drop a live one
fn prune(attempts: &mut Vec<DeploymentAttempt>, limit: usize) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut keep = vec![true; attempts.len()];

    for (idx, attempt) in attempts.iter().enumerate().rev() {
        if !attempt.is_terminal() {
            continue;
        }
        let count = seen.entry(attempt.service.clone()).or_insert(0);
        *count += 1;
        if *count > limit {
            keep[idx] = false;
        }
    }

    let mut idx = 0;
    attempts.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::deploy::fsm::{AttemptEvent, AttemptState};
    use crate::models::service::ServiceSpec;

    fn attempt(id: &str, service: &str) -> DeploymentAttempt {
        let spec: ServiceSpec = serde_yaml::from_str(&format!(
            "name: {service}\nimage: acme/{service}:1\nnetworks: [internal]\nport: 80\n"
        ))
        .unwrap();
        DeploymentAttempt::new(id.into(), spec, "1".into(), None)
    }

    fn finished(id: &str, service: &str) -> DeploymentAttempt {
        let mut a = attempt(id, service);
        a.apply(AttemptEvent::Fail).unwrap();
        a
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("attempts.json"));
        {
            let book = AttemptBook::open(file.clone(), 10).await.unwrap();
            book.insert(attempt("a1", "api")).await.unwrap();
            book.insert(finished("a2", "db")).await.unwrap();
        }

        let book = AttemptBook::open(file, 10).await.unwrap();
        assert_eq!(book.list(None).await.len(), 2);
        assert_eq!(book.in_progress_for("api").await.map(|a| a.id), Some("a1".into()));
        assert!(book.in_progress_for("db").await.is_none());
        assert_eq!(book.latest_for("db").await.map(|a| a.state), Some(AttemptState::Failed));
    }

    #[tokio::test]
    async fn test_history_limit_keeps_live_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let book = AttemptBook::open(File::new(dir.path().join("a.json")), 2)
            .await
            .unwrap();

        book.insert(attempt("live", "api")).await.unwrap();
        for id in ["f1", "f2", "f3"] {
            book.insert(finished(id, "api")).await.unwrap();
        }
        book.insert(finished("other", "db")).await.unwrap();

        let ids: Vec<_> = book.list(Some("api")).await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["f3", "f2", "live"]);
        assert_eq!(book.list(Some("db")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let book = Arc::new(
            AttemptBook::open(File::new(dir.path().join("a.json")), 10)
                .await
                .unwrap(),
        );
        let mut a = attempt("a1", "api");
        book.insert(a.clone()).await.unwrap();

        let waiter = {
            let book = book.clone();
            tokio::spawn(async move { book.wait_terminal("a1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.apply(AttemptEvent::Fail).unwrap();
        book.update(&a).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.state, AttemptState::Failed);

        assert!(matches!(
            book.wait_terminal("missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
