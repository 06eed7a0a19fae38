use std::future::Future;
use std::time::Duration;

use tracing::warn;

use visitflow_core::config::RetryConfig;
use visitflow_core::error::{Result, VisitflowError};

/// Exponential backoff with optional jitter, bounded by `max_attempts`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self { config }
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub last_error: VisitflowError,
}

impl RetryFailure {
    /// The last observed failure, as recorded in the DLQ.
    pub fn reason(&self) -> String {
        match &self.last_error {
            VisitflowError::Delivery { message, .. }
            | VisitflowError::DeliveryRejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn into_error(self, action: &str) -> VisitflowError {
        VisitflowError::DeliveryExhausted {
            action: action.to_string(),
            attempts: self.attempts,
            reason: self.reason(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exp);
        let ms = ms.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }

    /// Delay after failed `attempt` (1-based), jittered into 0.85x..1.15x when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter {
            return base;
        }
        let jitter = 0.85 + rand::random::<f64>() * 0.3;
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, action: &str, mut op: F) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= max_attempts => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let backoff = self.delay_for(attempt);
                    warn!(
                        action,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying action"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
