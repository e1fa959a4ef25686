//! Retry with backoff for cluster operations.
//!
//! [`RetryPolicy::execute`] runs an operation until it succeeds, fails with a
//! non-retriable error, exhausts its retry budget, runs out of its overall
//! time budget, or is cancelled. Each attempt gets a request timeout derived
//! from the overall budget (see [`RetryPolicy::request_timeout`]).
//!
//! `execute` abandons an attempt once its request timeout elapses, which only
//! suits read-only queries. [`RetryPolicy::execute_awaited`] hands the
//! timeout to the operation and always awaits an issued attempt, so a
//! mutating call is never sent twice while the first is still running.
//! Cancellation is observed before each attempt and during backoff.

use crate::error::ChaosError;
use chaos_common::{ClusterError, EngineConfig};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    Exponential,
    /// Always `base_delay`.
    Fixed,
}

/// Outcome of a failed [`RetryPolicy::execute`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: ClusterError,
    },

    #[error("{operation} failed: {error}")]
    Fatal {
        operation: String,
        error: ClusterError,
    },

    #[error("{operation} timed out after {timeout:?} ({attempts} attempts)")]
    Timeout {
        operation: String,
        timeout: Duration,
        attempts: u32,
        last: Option<ClusterError>,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl From<RetryError> for ChaosError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { last, .. } => ChaosError::Transient(last),
            RetryError::Fatal { error, .. } => ChaosError::Cluster(error),
            RetryError::Timeout {
                operation, timeout, ..
            } => ChaosError::Timeout { operation, timeout },
            RetryError::Cancelled { .. } => ChaosError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AttemptBound {
    RequestTimeout,
    Awaited,
}

/// Backoff and request-timeout policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to each delay.
    pub jitter: f64,
    pub backoff: Backoff,
    pub request_timeout_factor: f64,
    pub min_request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            backoff: Backoff::Exponential,
            request_timeout_factor: chaos_common::config::DEFAULT_REQUEST_TIMEOUT_FACTOR,
            min_request_timeout: chaos_common::config::DEFAULT_MIN_REQUEST_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy using the engine's request-timeout settings.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            request_timeout_factor: config.request_timeout_factor,
            min_request_timeout: config.min_request_timeout,
            ..Self::default()
        }
    }

    /// Same request-timeout settings, fixed delay without jitter.
    #[must_use]
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed;
        self.base_delay = delay;
        self.max_delay = delay;
        self.jitter = 0.0;
        self
    }

    /// `max(factor * operation_timeout, floor)`.
    pub fn request_timeout(&self, operation_timeout: Duration) -> Duration {
        operation_timeout
            .mul_f64(self.request_timeout_factor)
            .max(self.min_request_timeout)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64().max(0.0);

        let mut delay = match self.backoff {
            Backoff::Fixed => base_secs,
            Backoff::Exponential => {
                let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1)) as f64;
                (base_secs * multiplier).min(max_secs)
            }
        };

        if self.jitter > 0.0 && delay > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            delay = (delay * (1.0 + jitter)).max(0.0);
        }

        Duration::from_secs_f64(delay)
    }

    /// Run `op` with retries, abandoning any attempt that outlives its
    /// request timeout.
    ///
    /// `op` receives the per-attempt request timeout. Up to `max_retries`
    /// retries follow the first attempt. Exhausting the retry budget is
    /// reported as [`RetryError::Exhausted`] even if the overall deadline
    /// passes at the same moment.
    pub async fn execute<F, Fut, T, R>(
        &self,
        operation: &str,
        op: F,
        is_retriable: R,
        max_retries: u32,
        operation_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
        R: Fn(&ClusterError) -> bool,
    {
        self.run(
            operation,
            op,
            is_retriable,
            max_retries,
            operation_timeout,
            cancel,
            AttemptBound::RequestTimeout,
        )
        .await
    }

    /// Like [`execute`](Self::execute), but every issued attempt runs to
    /// completion. Only errors returned by `op` itself are retried.
    pub async fn execute_awaited<F, Fut, T, R>(
        &self,
        operation: &str,
        op: F,
        is_retriable: R,
        max_retries: u32,
        operation_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
        R: Fn(&ClusterError) -> bool,
    {
        self.run(
            operation,
            op,
            is_retriable,
            max_retries,
            operation_timeout,
            cancel,
            AttemptBound::Awaited,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<F, Fut, T, R>(
        &self,
        operation: &str,
        mut op: F,
        is_retriable: R,
        max_retries: u32,
        operation_timeout: Duration,
        cancel: &CancellationToken,
        bound: AttemptBound,
    ) -> Result<T, RetryError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
        R: Fn(&ClusterError) -> bool,
    {
        let deadline = Instant::now() + operation_timeout;
        let request_timeout = self.request_timeout(operation_timeout);
        let mut failures: u32 = 0;
        let mut last: Option<ClusterError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(operation, attempts = failures, "Operation timed out");
                return Err(RetryError::Timeout {
                    operation: operation.to_string(),
                    timeout: operation_timeout,
                    attempts: failures,
                    last,
                });
            }

            let attempt_timeout = request_timeout.min(remaining);
            debug!(
                operation,
                attempt = failures + 1,
                timeout_ms = attempt_timeout.as_millis() as u64,
                "Starting attempt"
            );

            let result = match bound {
                AttemptBound::RequestTimeout => timeout(attempt_timeout, op(attempt_timeout))
                    .await
                    .unwrap_or(Err(ClusterError::Timeout(attempt_timeout))),
                AttemptBound::Awaited => op(attempt_timeout).await,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retriable(&err) {
                warn!(operation, error = %err, "Attempt failed (non-retriable)");
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    error: err,
                });
            }

            failures += 1;
            if failures > max_retries {
                warn!(
                    operation,
                    attempts = failures,
                    error = %err,
                    "Maximum number of retries achieved"
                );
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: failures,
                    last: err,
                });
            }

            let delay = self
                .backoff_delay(failures)
                .min(deadline.saturating_duration_since(Instant::now()));
            debug!(
                operation,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed (retriable), backing off"
            );
            last = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { operation: operation.to_string() });
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
