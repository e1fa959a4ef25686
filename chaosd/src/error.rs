//! Engine error taxonomy.

use crate::state_store::StateStoreError;
use chaos_common::{ClusterError, ConfigError, SafetyViolation, TelemetryId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the chaos engine.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// Retriable cluster failure that outlived its retry budget.
    #[error("transient cluster error: {0}")]
    Transient(ClusterError),

    /// Non-retriable cluster failure.
    #[error("cluster error: {0}")]
    Cluster(ClusterError),

    #[error(transparent)]
    SafetyViolation(#[from] SafetyViolation),

    /// Invalid run parameters. The run never begins.
    #[error("invalid chaos parameters: {0}")]
    Configuration(#[from] ConfigError),

    /// Snapshot capture failed on every allowed attempt.
    #[error("{operation}: maximum number of retries achieved after {attempts} attempts: {last}")]
    MaxRetriesAchieved {
        operation: String,
        attempts: u32,
        last: ClusterError,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("chaos is already running")]
    AlreadyRunning,

    #[error("scheduler lock not acquired after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("state persistence failed: {0}")]
    Persistence(#[from] StateStoreError),
}

impl ChaosError {
    /// Whether this error ends the run rather than the current iteration.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            Self::MaxRetriesAchieved { .. } => true,
            Self::SafetyViolation(v) => v.is_run_fatal(),
            _ => false,
        }
    }

    /// Telemetry id used when this error is reported.
    pub fn telemetry_id(&self) -> Option<TelemetryId> {
        match self {
            Self::SafetyViolation(v) => Some(v.id),
            Self::MaxRetriesAchieved { .. } => {
                Some(TelemetryId::GetClusterSnapshotMaximumRetriesAchieved)
            }
            Self::LockTimeout { .. } => Some(TelemetryId::ChaosSchedulerLockAcquisitionTimeout),
            Self::Transient(_) | Self::Cluster(_) | Self::Timeout { .. } => {
                Some(TelemetryId::ExecutorUnexpectedError)
            }
            Self::Configuration(_)
            | Self::AlreadyRunning
            | Self::Cancelled
            | Self::Persistence(_) => None,
        }
    }
}
