//! Bounded admission for backend operations.
//!
//! Each adapter admits at most `pool_size` concurrent backend operations.
//! Waiting for a slot is bounded; when the wait expires the caller gets
//! `BackendUnavailable` instead of queueing indefinitely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct OperationGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
}

impl OperationGate {
    pub fn new(capacity: usize, wait: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
        }
    }

    /// Wait for a free slot, at most for the configured timeout.
    pub async fn acquire(&self, operation: &str) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StoreError::BackendUnavailable(
                "adapter is shutting down".into(),
            )),
            Err(_) => {
                warn!(
                    "{}: no free session after {}ms ({} in use)",
                    operation,
                    self.wait.as_millis(),
                    self.capacity
                );
                Err(StoreError::BackendUnavailable(format!(
                    "pool exhausted: {} sessions busy for {}ms",
                    self.capacity,
                    self.wait.as_millis()
                )))
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
