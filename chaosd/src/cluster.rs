//! Contracts for the external cluster collaborators.
//!
//! The engine never talks to a cluster directly. Topology queries, health
//! reports and fault execution all go through these traits, so the same
//! engine runs against a real transport or against [`crate::sim`].

use async_trait::async_trait;
use chaos_common::{
    ClusterError, EntityRef, FaultAction, HealthState, InFlightMarker, NodeInfo, PartitionInfo,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read-only topology queries.
#[async_trait]
pub trait ClusterQueryClient: Send + Sync {
    async fn get_node_list(&self, timeout: Duration) -> Result<Vec<NodeInfo>, ClusterError>;

    async fn get_partition_list(
        &self,
        timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ClusterError>;

    /// Operations already in progress against cluster entities.
    async fn get_in_flight_markers(
        &self,
        timeout: Duration,
    ) -> Result<Vec<InFlightMarker>, ClusterError>;
}

/// A health report submitted on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub source_id: String,
    pub property: String,
    pub state: HealthState,
    pub description: String,
    /// `None` reports against the cluster itself.
    pub entity: Option<EntityRef>,
    pub sequence_number: i64,
    pub time_to_live: Option<Duration>,
}

#[async_trait]
pub trait HealthClient: Send + Sync {
    async fn report_health(&self, report: HealthReport) -> Result<(), ClusterError>;
}

/// Executes a single fault action.
///
/// Implementations should observe `cancel` cooperatively. The engine never
/// drops an issued call; it waits for the result.
#[async_trait]
pub trait FaultActionClient: Send + Sync {
    async fn execute(
        &self,
        action: &FaultAction,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(), ClusterError>;
}

/// The three collaborators bundled for the engine.
#[derive(Clone)]
pub struct ClusterClients {
    pub query: Arc<dyn ClusterQueryClient>,
    pub health: Arc<dyn HealthClient>,
    pub faults: Arc<dyn FaultActionClient>,
}

impl ClusterClients {
    pub fn new(
        query: Arc<dyn ClusterQueryClient>,
        health: Arc<dyn HealthClient>,
        faults: Arc<dyn FaultActionClient>,
    ) -> Self {
        Self {
            query,
            health,
            faults,
        }
    }

    /// Use one object for all three roles.
    pub fn from_shared<T>(cluster: Arc<T>) -> Self
    where
        T: ClusterQueryClient + HealthClient + FaultActionClient + 'static,
    {
        Self {
            query: cluster.clone(),
            health: cluster.clone(),
            faults: cluster,
        }
    }
}
