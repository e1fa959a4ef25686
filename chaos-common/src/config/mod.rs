//! Engine tunables.
//!
//! Run behavior lives in [`ChaosParameters`](crate::parameters::ChaosParameters).
//! [`EngineConfig`] holds the knobs that belong to the deployment rather than
//! the run: timeouts, retry budgets and scheduler timing. Values come from
//! `CHAOS_*` environment variables with the defaults below.

pub mod env;

pub use env::{EnvError, EnvParser};

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

// ── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_REQUEST_TIMEOUT_FACTOR: f64 = 0.2;
pub const DEFAULT_MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_SNAPSHOT_RETRIES: u32 = 15;
pub const DEFAULT_SNAPSHOT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SCHEDULER_CYCLE_WAIT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SCHEDULER_LOCK_WAIT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_SCHEDULER_LOCK_RETRIES: u32 = 3;
pub const DEFAULT_MAX_SELECTION_ATTEMPTS: u32 = 3;
pub const DEFAULT_FAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FAULT_ACTION_RETRIES: u32 = 3;
pub const DEFAULT_STABILIZATION_POLL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_EVENTS: usize = 30_000;

/// Deployment-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fraction of an operation timeout given to each request.
    pub request_timeout_factor: f64,
    /// Floor for per-request timeouts.
    pub min_request_timeout: Duration,
    pub max_snapshot_retries: u32,
    pub snapshot_operation_timeout: Duration,
    /// Polling tick of the scheduler loop.
    pub scheduler_cycle_wait: Duration,
    /// Bounded wait for the scheduler state lock.
    pub scheduler_lock_wait: Duration,
    pub scheduler_lock_retries: u32,
    /// Selection attempts before an iteration gives up and waits.
    pub max_selection_attempts: u32,
    pub fault_action_timeout: Duration,
    pub fault_action_retries: u32,
    pub stabilization_poll: Duration,
    pub max_events: usize,
    /// Abort the process on safety violations instead of returning errors.
    pub engine_assert_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_factor: DEFAULT_REQUEST_TIMEOUT_FACTOR,
            min_request_timeout: DEFAULT_MIN_REQUEST_TIMEOUT,
            max_snapshot_retries: DEFAULT_MAX_SNAPSHOT_RETRIES,
            snapshot_operation_timeout: DEFAULT_SNAPSHOT_OPERATION_TIMEOUT,
            scheduler_cycle_wait: DEFAULT_SCHEDULER_CYCLE_WAIT,
            scheduler_lock_wait: DEFAULT_SCHEDULER_LOCK_WAIT,
            scheduler_lock_retries: DEFAULT_SCHEDULER_LOCK_RETRIES,
            max_selection_attempts: DEFAULT_MAX_SELECTION_ATTEMPTS,
            fault_action_timeout: DEFAULT_FAULT_ACTION_TIMEOUT,
            fault_action_retries: DEFAULT_FAULT_ACTION_RETRIES,
            stabilization_poll: DEFAULT_STABILIZATION_POLL,
            max_events: DEFAULT_MAX_EVENTS,
            engine_assert_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Load from `CHAOS_*` variables. Returns every parse error at once.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let mut parser = EnvParser::new();
        let config = Self::from_parser(&mut parser);
        if parser.has_errors() {
            return Err(parser.take_errors());
        }
        Ok(config)
    }

    fn from_parser(p: &mut EnvParser) -> Self {
        let hour = Duration::from_secs(3600);
        Self {
            request_timeout_factor: p.get_f64_range(
                "REQUEST_TIMEOUT_FACTOR",
                DEFAULT_REQUEST_TIMEOUT_FACTOR,
                0.01,
                1.0,
            ),
            min_request_timeout: p.get_millis_range(
                "MIN_REQUEST_TIMEOUT_MS",
                DEFAULT_MIN_REQUEST_TIMEOUT,
                Duration::from_millis(1),
                hour,
            ),
            max_snapshot_retries: p.get_u32_range(
                "MAX_SNAPSHOT_RETRIES",
                DEFAULT_MAX_SNAPSHOT_RETRIES,
                0,
                1000,
            ),
            snapshot_operation_timeout: p.get_millis_range(
                "SNAPSHOT_OPERATION_TIMEOUT_MS",
                DEFAULT_SNAPSHOT_OPERATION_TIMEOUT,
                Duration::from_secs(1),
                hour,
            ),
            scheduler_cycle_wait: p.get_millis_range(
                "SCHEDULER_CYCLE_WAIT_MS",
                DEFAULT_SCHEDULER_CYCLE_WAIT,
                Duration::from_millis(10),
                Duration::from_secs(60),
            ),
            scheduler_lock_wait: p.get_millis_range(
                "SCHEDULER_LOCK_WAIT_MS",
                DEFAULT_SCHEDULER_LOCK_WAIT,
                Duration::from_millis(10),
                Duration::from_secs(600),
            ),
            scheduler_lock_retries: p.get_u32_range(
                "SCHEDULER_LOCK_RETRIES",
                DEFAULT_SCHEDULER_LOCK_RETRIES,
                0,
                100,
            ),
            max_selection_attempts: p.get_u32_range(
                "MAX_SELECTION_ATTEMPTS",
                DEFAULT_MAX_SELECTION_ATTEMPTS,
                1,
                100,
            ),
            fault_action_timeout: p.get_millis_range(
                "FAULT_ACTION_TIMEOUT_MS",
                DEFAULT_FAULT_ACTION_TIMEOUT,
                Duration::from_millis(100),
                hour,
            ),
            fault_action_retries: p.get_u32_range(
                "FAULT_ACTION_RETRIES",
                DEFAULT_FAULT_ACTION_RETRIES,
                0,
                100,
            ),
            stabilization_poll: p.get_millis_range(
                "STABILIZATION_POLL_MS",
                DEFAULT_STABILIZATION_POLL,
                Duration::from_millis(10),
                Duration::from_secs(600),
            ),
            max_events: p.get_u64_range("MAX_EVENTS", DEFAULT_MAX_EVENTS as u64, 1, 10_000_000)
                as usize,
            engine_assert_enabled: p.get_bool("ENGINE_ASSERT_ENABLED", false),
        }
    }

    /// Per-request timeout for an operation with the given overall budget.
    pub fn request_timeout(&self, operation_timeout: Duration) -> Duration {
        operation_timeout
            .mul_f64(self.request_timeout_factor)
            .max(self.min_request_timeout)
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let c = EngineConfig::default();
        assert_eq!(c.max_snapshot_retries, 15);
        assert_eq!(c.scheduler_cycle_wait, Duration::from_secs(1));
        assert_eq!(c.scheduler_lock_wait, Duration::from_secs(20));
        assert!(!c.engine_assert_enabled);
    }

    #[test]
    fn test_request_timeout_has_floor() {
        let c = EngineConfig::default();
        assert_eq!(c.request_timeout(Duration::from_secs(10)), Duration::from_secs(15));
        assert_eq!(c.request_timeout(Duration::from_secs(300)), Duration::from_secs(60));
    }

    #[test]
    fn test_from_env_reads_overrides_and_collects_errors() {
        let _guard = env_test_lock();
        // SAFETY: serialized by env_test_lock
        unsafe {
            std::env::set_var("CHAOS_MAX_SNAPSHOT_RETRIES", "4");
            std::env::set_var("CHAOS_ENGINE_ASSERT_ENABLED", "true");
        }
        let c = EngineConfig::from_env().unwrap();
        assert_eq!(c.max_snapshot_retries, 4);
        assert!(c.engine_assert_enabled);

        // SAFETY: serialized by env_test_lock
        unsafe {
            std::env::set_var("CHAOS_MAX_EVENTS", "0");
            std::env::set_var("CHAOS_REQUEST_TIMEOUT_FACTOR", "lots");
        }
        let errors = EngineConfig::from_env().unwrap_err();
        assert_eq!(errors.len(), 2);

        // SAFETY: serialized by env_test_lock
        unsafe {
            for var in [
                "CHAOS_MAX_SNAPSHOT_RETRIES",
                "CHAOS_ENGINE_ASSERT_ENABLED",
                "CHAOS_MAX_EVENTS",
                "CHAOS_REQUEST_TIMEOUT_FACTOR",
            ] {
                std::env::remove_var(var);
            }
        }
    }
}
