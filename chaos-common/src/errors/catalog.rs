//! Telemetry-id catalog for the chaos engine.
//!
//! Every safety or validation failure carries exactly one id from this closed
//! catalog. Ids feed dashboards, alerting and test classification, so the
//! string form of a variant never changes and is never reused for another
//! condition. New conditions get new variants.
//!
//! # Categories
//!
//! | Category   | Raised by                                       |
//! |------------|-------------------------------------------------|
//! | Fault      | Per-fault safety checks (node, replica, package)|
//! | Validation | Pre/post assertions around a fault batch        |
//! | Snapshot   | Cluster snapshot capture                        |
//! | Scheduler  | Run lifecycle and state handling                |
//! | Executor   | Fault execution and unexpected iteration errors |
//!
//! # Example
//!
//! ```rust
//! use chaos_common::errors::catalog::TelemetryId;
//!
//! let id = TelemetryId::FaultNodeUnsafeNode;
//! assert_eq!(id.as_str(), "FaultNode_UnsafeNode");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable telemetry ids for engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TelemetryId {
    // =========================================================================
    // Fault safety
    // =========================================================================
    /// Restarting the node would break quorum or cluster majority.
    #[serde(rename = "FaultNode_UnsafeNode")]
    FaultNodeUnsafeNode,
    /// Node targeted by a node fault is not up.
    #[serde(rename = "FaultNode_NodeNotUp")]
    FaultNodeNodeNotUp,
    /// Restarting the code package would break quorum for a hosted partition.
    #[serde(rename = "RestartCodePackage_UnsafeCodePackage")]
    RestartCodePackageUnsafeCodePackage,
    /// Replica restart targeted a partition that cannot tolerate it.
    #[serde(rename = "RestartReplica_PartitionNotFaultTolerant")]
    RestartReplicaPartitionNotFaultTolerant,
    /// Replica removal targeted a partition that cannot tolerate it.
    #[serde(rename = "RemoveReplica_PartitionNotFaultTolerant")]
    RemoveReplicaPartitionNotFaultTolerant,
    /// Replica move targeted a partition that cannot tolerate it.
    #[serde(rename = "MoveReplica_PartitionNotFaultTolerant")]
    MoveReplicaPartitionNotFaultTolerant,
    /// Replica move has no valid destination node.
    #[serde(rename = "MoveReplica_NoDestinationNode")]
    MoveReplicaNoDestinationNode,

    // =========================================================================
    // Validation
    // =========================================================================
    /// A selected fault targets an entity that is transitioning.
    #[serde(rename = "PreAssert_TargetTransitioning")]
    PreAssertTargetTransitioning,
    /// Cluster health regressed past the configured policy after faults.
    #[serde(rename = "ValidateCluster_HealthRegressed")]
    ValidateClusterHealthRegressed,

    // =========================================================================
    // Snapshot
    // =========================================================================
    /// Snapshot capture exhausted its retry budget.
    #[serde(rename = "GetClusterSnapshotAction_MaximumNumberOfRetriesAchieved")]
    GetClusterSnapshotMaximumRetriesAchieved,

    // =========================================================================
    // Scheduler
    // =========================================================================
    /// Persisted Running state without a live controller was reset.
    #[serde(rename = "ChaosScheduler_StateResetOnRestart")]
    ChaosSchedulerStateResetOnRestart,
    /// The scheduler state lock could not be acquired within the bounded wait.
    #[serde(rename = "ChaosScheduler_LockAcquisitionTimeout")]
    ChaosSchedulerLockAcquisitionTimeout,

    // =========================================================================
    // Executor
    // =========================================================================
    /// A fault action failed with a non-retriable error.
    #[serde(rename = "ExecuteFault_ActionFailed")]
    ExecuteFaultActionFailed,
    /// An iteration failed for a reason not covered by another id.
    #[serde(rename = "Executor_UnexpectedError")]
    ExecutorUnexpectedError,
}

impl TelemetryId {
    /// All ids in the catalog.
    pub fn all() -> &'static [TelemetryId] {
        &[
            Self::FaultNodeUnsafeNode,
            Self::FaultNodeNodeNotUp,
            Self::RestartCodePackageUnsafeCodePackage,
            Self::RestartReplicaPartitionNotFaultTolerant,
            Self::RemoveReplicaPartitionNotFaultTolerant,
            Self::MoveReplicaPartitionNotFaultTolerant,
            Self::MoveReplicaNoDestinationNode,
            Self::PreAssertTargetTransitioning,
            Self::ValidateClusterHealthRegressed,
            Self::GetClusterSnapshotMaximumRetriesAchieved,
            Self::ChaosSchedulerStateResetOnRestart,
            Self::ChaosSchedulerLockAcquisitionTimeout,
            Self::ExecuteFaultActionFailed,
            Self::ExecutorUnexpectedError,
        ]
    }

    /// Stable string form used on the wire and in dashboards.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaultNodeUnsafeNode => "FaultNode_UnsafeNode",
            Self::FaultNodeNodeNotUp => "FaultNode_NodeNotUp",
            Self::RestartCodePackageUnsafeCodePackage => "RestartCodePackage_UnsafeCodePackage",
            Self::RestartReplicaPartitionNotFaultTolerant => {
                "RestartReplica_PartitionNotFaultTolerant"
            }
            Self::RemoveReplicaPartitionNotFaultTolerant => {
                "RemoveReplica_PartitionNotFaultTolerant"
            }
            Self::MoveReplicaPartitionNotFaultTolerant => "MoveReplica_PartitionNotFaultTolerant",
            Self::MoveReplicaNoDestinationNode => "MoveReplica_NoDestinationNode",
            Self::PreAssertTargetTransitioning => "PreAssert_TargetTransitioning",
            Self::ValidateClusterHealthRegressed => "ValidateCluster_HealthRegressed",
            Self::GetClusterSnapshotMaximumRetriesAchieved => {
                "GetClusterSnapshotAction_MaximumNumberOfRetriesAchieved"
            }
            Self::ChaosSchedulerStateResetOnRestart => "ChaosScheduler_StateResetOnRestart",
            Self::ChaosSchedulerLockAcquisitionTimeout => "ChaosScheduler_LockAcquisitionTimeout",
            Self::ExecuteFaultActionFailed => "ExecuteFault_ActionFailed",
            Self::ExecutorUnexpectedError => "Executor_UnexpectedError",
        }
    }

    /// Parse the stable string form.
    pub fn from_str_id(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|id| id.as_str() == s)
    }

    /// Category of this id.
    pub fn category(&self) -> TelemetryCategory {
        match self {
            Self::FaultNodeUnsafeNode
            | Self::FaultNodeNodeNotUp
            | Self::RestartCodePackageUnsafeCodePackage
            | Self::RestartReplicaPartitionNotFaultTolerant
            | Self::RemoveReplicaPartitionNotFaultTolerant
            | Self::MoveReplicaPartitionNotFaultTolerant
            | Self::MoveReplicaNoDestinationNode => TelemetryCategory::Fault,
            Self::PreAssertTargetTransitioning | Self::ValidateClusterHealthRegressed => {
                TelemetryCategory::Validation
            }
            Self::GetClusterSnapshotMaximumRetriesAchieved => TelemetryCategory::Snapshot,
            Self::ChaosSchedulerStateResetOnRestart
            | Self::ChaosSchedulerLockAcquisitionTimeout => TelemetryCategory::Scheduler,
            Self::ExecuteFaultActionFailed | Self::ExecutorUnexpectedError => {
                TelemetryCategory::Executor
            }
        }
    }

    /// One-line description of the condition.
    pub fn description(&self) -> &'static str {
        match self {
            Self::FaultNodeUnsafeNode => {
                "Faulting the node would leave a partition or the cluster without quorum"
            }
            Self::FaultNodeNodeNotUp => "Node selected for a node fault is not up",
            Self::RestartCodePackageUnsafeCodePackage => {
                "Restarting the code package would leave a hosted partition without quorum"
            }
            Self::RestartReplicaPartitionNotFaultTolerant => {
                "Partition cannot tolerate a replica restart"
            }
            Self::RemoveReplicaPartitionNotFaultTolerant => {
                "Partition cannot tolerate a replica removal"
            }
            Self::MoveReplicaPartitionNotFaultTolerant => {
                "Partition cannot tolerate a replica move"
            }
            Self::MoveReplicaNoDestinationNode => "No up node is available to receive the replica",
            Self::PreAssertTargetTransitioning => {
                "A selected fault targets an entity that is already transitioning"
            }
            Self::ValidateClusterHealthRegressed => {
                "Cluster did not stabilize within the configured health policy after faults"
            }
            Self::GetClusterSnapshotMaximumRetriesAchieved => {
                "Cluster snapshot capture failed on every allowed retry"
            }
            Self::ChaosSchedulerStateResetOnRestart => {
                "Persisted running state had no live controller and was reset to stopped"
            }
            Self::ChaosSchedulerLockAcquisitionTimeout => {
                "Scheduler state lock was not acquired within the bounded wait"
            }
            Self::ExecuteFaultActionFailed => "A fault action failed with a non-retriable error",
            Self::ExecutorUnexpectedError => "An iteration failed with an unexpected error",
        }
    }

    /// Whether a failure with this id halts the run rather than the iteration.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::GetClusterSnapshotMaximumRetriesAchieved)
    }

    /// Catalog entry for this id.
    pub fn entry(&self) -> TelemetryEntry {
        TelemetryEntry {
            id: self.as_str(),
            category: self.category(),
            description: self.description(),
            run_fatal: self.is_run_fatal(),
        }
    }
}

impl fmt::Display for TelemetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Telemetry id categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCategory {
    Fault,
    Validation,
    Snapshot,
    Scheduler,
    Executor,
}

impl fmt::Display for TelemetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault => write!(f, "fault"),
            Self::Validation => write!(f, "validation"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Scheduler => write!(f, "scheduler"),
            Self::Executor => write!(f, "executor"),
        }
    }
}

/// A complete catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEntry {
    pub id: &'static str,
    pub category: TelemetryCategory,
    pub description: &'static str,
    pub run_fatal: bool,
}
