//! Shared error types for the chaos engine.
//!
//! - [`catalog`]: the closed telemetry-id taxonomy
//! - [`ClusterError`]: failures reported by cluster collaborators
//! - [`ConfigError`]: invalid run parameters
//! - [`SafetyViolation`]: a failed safety assertion

pub mod catalog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use catalog::{TelemetryCategory, TelemetryEntry, TelemetryId};

/// Error codes reported by cluster collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterErrorCode {
    NotPrimary,
    ServiceOffline,
    ReconfigurationPending,
    GatewayUnreachable,
    NodeNotFound,
    PartitionNotFound,
    InvalidReplicaStateForReplicaOperation,
    NodeIsDown,
    AlreadyInTargetState,
    InvalidArgument,
    AccessDenied,
}

impl ClusterErrorCode {
    /// Codes that indicate temporary unavailability.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NotPrimary
                | Self::ServiceOffline
                | Self::ReconfigurationPending
                | Self::GatewayUnreachable
                | Self::InvalidReplicaStateForReplicaOperation
        )
    }
}

impl std::fmt::Display for ClusterErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotPrimary => "not_primary",
            Self::ServiceOffline => "service_offline",
            Self::ReconfigurationPending => "reconfiguration_pending",
            Self::GatewayUnreachable => "gateway_unreachable",
            Self::NodeNotFound => "node_not_found",
            Self::PartitionNotFound => "partition_not_found",
            Self::InvalidReplicaStateForReplicaOperation => {
                "invalid_replica_state_for_replica_operation"
            }
            Self::NodeIsDown => "node_is_down",
            Self::AlreadyInTargetState => "already_in_target_state",
            Self::InvalidArgument => "invalid_argument",
            Self::AccessDenied => "access_denied",
        };
        write!(f, "{s}")
    }
}

/// Failure reported by a cluster collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The call did not complete within its request timeout.
    #[error("cluster operation timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster rejected the call with an error code.
    #[error("cluster operation failed ({code}): {message}")]
    Operation {
        code: ClusterErrorCode,
        message: String,
    },

    /// Transport-level failure before the cluster answered.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The call was cancelled by the caller.
    #[error("cluster operation cancelled")]
    Cancelled,
}

impl ClusterError {
    /// Create an operation error.
    pub fn operation(code: ClusterErrorCode, message: impl Into<String>) -> Self {
        Self::Operation {
            code,
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Operation { code, .. } => code.is_transient(),
            Self::Cancelled => false,
        }
    }
}

/// Invalid run parameters. Surfaced synchronously at start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} out of range: {value} (valid: {min}..={max})")]
    OutOfRange {
        name: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("context has {count} entries, at most {max} allowed")]
    TooManyContextEntries { count: usize, max: usize },

    #[error("context {what} for key '{key}' is {len} characters, at most {max} allowed")]
    ContextEntryTooLong {
        key: String,
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("context key '{0}' uses the reserved internal prefix but is not a recognized key")]
    ReservedKey(String),

    #[error("invalid value '{value}' for context key '{key}': expected {expected}")]
    InvalidContextValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid target filter: {0}")]
    InvalidTargetFilter(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("invalid value '{value}' for parameter '{name}': expected {expected}")]
    InvalidParameterValue {
        name: String,
        value: String,
        expected: &'static str,
    },

    #[error("failed to parse parameters: {0}")]
    Parse(String),
}

/// Reference to the snapshot a safety check was evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
}

/// A failed safety assertion.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("safety violation {id}: {message}")]
pub struct SafetyViolation {
    pub id: TelemetryId,
    pub message: String,
    pub snapshot: Option<SnapshotRef>,
    /// Raised by the forced-assert override rather than a real condition.
    pub forced: bool,
}

impl SafetyViolation {
    pub fn new(id: TelemetryId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            snapshot: None,
            forced: false,
        }
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SnapshotRef) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn is_run_fatal(&self) -> bool {
        self.id.is_run_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_error_retry_classification() {
        assert!(ClusterError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ClusterError::Unavailable("gateway".into()).is_retryable());
        assert!(ClusterError::operation(ClusterErrorCode::NotPrimary, "moved").is_retryable());
        assert!(!ClusterError::operation(ClusterErrorCode::AccessDenied, "no").is_retryable());
        assert!(!ClusterError::operation(ClusterErrorCode::NodeNotFound, "gone").is_retryable());
        assert!(!ClusterError::Cancelled.is_retryable());
    }

    #[test]
    fn test_safety_violation_display_uses_stable_id() {
        let v = SafetyViolation::new(TelemetryId::FaultNodeUnsafeNode, "quorum loss on P1");
        assert_eq!(
            v.to_string(),
            "safety violation FaultNode_UnsafeNode: quorum loss on P1"
        );
        assert!(!v.is_run_fatal());
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::TooManyContextEntries {
            count: 101,
            max: 100,
        };
        assert!(err.to_string().contains("101"));
        let err = ConfigError::ReservedKey("ServiceFabric_Chaos_Internal_Context_Key_X".into());
        assert!(err.to_string().contains("reserved"));
    }
}
