//! Bounded retry of transient failures.
//!
//! Only `BackendUnavailable` is retried. Validation, not-found and corruption
//! errors are deterministic and returned on the first attempt. The session
//! slot is released while backing off.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::OperationGate;
use crate::config::RuntimeConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before attempt `attempt + 1`: base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs backend operations through the gate with retry.
#[derive(Debug, Clone)]
pub struct OperationRunner {
    backend: &'static str,
    gate: OperationGate,
    policy: RetryPolicy,
}

impl OperationRunner {
    pub fn new(backend: &'static str, gate: OperationGate, policy: RetryPolicy) -> Self {
        Self {
            backend,
            gate,
            policy,
        }
    }

    pub fn from_config(backend: &'static str, pool_size: usize, config: &RuntimeConfig) -> Self {
        Self::new(
            backend,
            OperationGate::new(pool_size, Duration::from_millis(config.pool_wait_timeout_ms)),
            RetryPolicy::from_config(config),
        )
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = self.gate.acquire(operation).await?;
                op().await
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} {} failed ({}), retry {}/{} in {}ms",
                        self.backend,
                        operation,
                        e,
                        attempt,
                        self.policy.max_attempts - 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn gate(&self) -> &OperationGate {
        &self.gate
    }
}
