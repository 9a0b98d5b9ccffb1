//! Per-service deployment locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::OrchestratorError;

/// One async mutex per service name.
///
/// The owned guard travels with the attempt task, so the lock is held for
/// exactly as long as the attempt is non-terminal.
#[derive(Default)]
pub struct ServiceLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, service: &str) -> Result<Arc<Mutex<()>>, OrchestratorError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| OrchestratorError::Internal("service lock table poisoned".to_string()))?;
        Ok(locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Take the lock for `service` or fail with `AttemptInProgress`
    pub fn try_acquire(&self, service: &str) -> Result<OwnedMutexGuard<()>, OrchestratorError> {
        self.lock_for(service)?
            .try_lock_owned()
            .map_err(|_| OrchestratorError::AttemptInProgress(service.to_string()))
    }

    /// Whether an attempt currently holds the lock for `service`
    pub fn is_locked(&self, service: &str) -> bool {
        self.lock_for(service)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
