//! Shared data model for the chaos fault-injection engine.
//!
//! Everything here is plain data plus pure functions: identifiers, run
//! parameters, cluster snapshots, fault actions, events, persisted run state,
//! the reason-field codec and the telemetry-id catalog. The engine itself
//! lives in `chaosd`.

pub mod compression;
pub mod config;
pub mod errors;
pub mod events;
pub mod faults;
pub mod parameters;
pub mod run_state;
pub mod snapshot;
pub mod testing;
pub mod types;

pub use config::EngineConfig;
pub use errors::{ClusterError, ClusterErrorCode, ConfigError, SafetyViolation, TelemetryId};
pub use events::{ChaosEvent, ChaosEventKind, StopReason};
pub use faults::{FaultAction, FaultKind};
pub use parameters::{
    ChaosParameters, ChaosTargetFilter, ClusterHealthPolicy, ContextFlags, FailoverPolicy,
};
pub use run_state::{ChaosStatus, DEFAULT_RUN_ID, RunState};
pub use snapshot::{
    ClusterStateSnapshot, HealthEvaluation, InFlightMarker, NodeInfo, PartitionInfo, ReplicaInfo,
    SnapshotDiff,
};
pub use types::{
    EntityRef, HealthState, NodeId, NodeStatus, PartitionId, ReplicaId, ReplicaRole, ReplicaStatus,
};
