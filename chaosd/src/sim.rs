//! In-process simulated cluster.
//!
//! [`SimulatedCluster`] implements all three collaborator traits over an
//! in-memory topology. Faults change node and replica state; recovery is
//! applied lazily on the next topology query once its delay has passed. The
//! daemon runs against it when no real transport is wired in, and every
//! engine test uses it.

use crate::cluster::{ClusterQueryClient, FaultActionClient, HealthClient, HealthReport};
use async_trait::async_trait;
use chaos_common::{
    ClusterError, ClusterErrorCode, ClusterStateSnapshot, EntityRef, FaultAction, HealthState,
    InFlightMarker, NodeId, NodeInfo, NodeStatus, PartitionId, PartitionInfo, ReplicaId,
    ReplicaInfo, ReplicaRole, ReplicaStatus,
};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_NODE_TYPE: &str = "NodeType0";
const STATEFUL_APP: &str = "fabric:/StatefulApp";
const STATELESS_APP: &str = "fabric:/StatelessApp";
const SYSTEM_APP: &str = "fabric:/System";

#[derive(Debug, Clone, Copy)]
enum PartitionKind {
    Stateful,
    Stateless,
    System,
}

pub struct SimulatedClusterBuilder {
    node_types: Vec<String>,
    partitions: Vec<(PartitionKind, usize, usize)>,
    recovery: Option<Duration>,
    action_delay: Duration,
}

impl Default for SimulatedClusterBuilder {
    fn default() -> Self {
        Self {
            node_types: Vec::new(),
            partitions: Vec::new(),
            recovery: Some(Duration::ZERO),
            action_delay: Duration::ZERO,
        }
    }
}

impl SimulatedClusterBuilder {
    /// Add `count` nodes of the default type.
    pub fn nodes(self, count: usize) -> Self {
        self.nodes_of_type(count, DEFAULT_NODE_TYPE)
    }

    pub fn nodes_of_type(mut self, count: usize, node_type: &str) -> Self {
        self.node_types
            .extend(std::iter::repeat_n(node_type.to_string(), count));
        self
    }

    /// `count` stateful partitions with `replicas` replicas each.
    pub fn stateful_partitions(mut self, count: usize, replicas: usize) -> Self {
        self.partitions
            .push((PartitionKind::Stateful, count, replicas));
        self
    }

    pub fn stateless_partitions(mut self, count: usize, instances: usize) -> Self {
        self.partitions
            .push((PartitionKind::Stateless, count, instances));
        self
    }

    pub fn system_partitions(mut self, count: usize, replicas: usize) -> Self {
        self.partitions.push((PartitionKind::System, count, replicas));
        self
    }

    /// Delay before faulted entities recover. `None` never recovers.
    pub fn recovery(mut self, delay: Option<Duration>) -> Self {
        self.recovery = delay;
        self
    }

    /// Time each fault action takes to complete.
    pub fn action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn build(self) -> SimulatedCluster {
        let nodes: Vec<NodeInfo> = self
            .node_types
            .iter()
            .enumerate()
            .map(|(i, node_type)| NodeInfo {
                id: NodeId::new(format!("N{}", i + 1)),
                node_type: node_type.clone(),
                status: NodeStatus::Up,
                health: HealthState::Ok,
                is_seed: i < 3,
            })
            .collect();

        let mut partitions = Vec::new();
        let mut next_replica_id: ReplicaId = 1;
        let mut placement_offset = 0usize;
        for (kind, count, replicas) in self.partitions {
            for i in 0..count {
                if nodes.is_empty() {
                    break;
                }
                let replicas = replicas.clamp(1, nodes.len());
                let (application, is_stateful, is_system) = match kind {
                    PartitionKind::Stateful => (STATEFUL_APP, true, false),
                    PartitionKind::Stateless => (STATELESS_APP, false, false),
                    PartitionKind::System => (SYSTEM_APP, true, true),
                };
                let replica_set = (0..replicas)
                    .map(|j| {
                        let node = &nodes[(placement_offset + j) % nodes.len()];
                        let id = next_replica_id;
                        next_replica_id += 1;
                        ReplicaInfo {
                            id,
                            node: node.id.clone(),
                            role: match (is_stateful, j) {
                                (false, _) => ReplicaRole::None,
                                (true, 0) => ReplicaRole::Primary,
                                (true, _) => ReplicaRole::ActiveSecondary,
                            },
                            status: ReplicaStatus::Ready,
                            health: HealthState::Ok,
                        }
                    })
                    .collect::<Vec<_>>();
                placement_offset += 1;
                partitions.push(PartitionInfo {
                    id: PartitionId::new_v4(),
                    application_name: application.to_string(),
                    service_name: format!("{application}/Svc{i}"),
                    is_system,
                    is_stateful,
                    target_replica_set_size: replicas as u32,
                    min_replica_set_size: if is_stateful {
                        (replicas as u32 / 2 + 1).min(replicas as u32)
                    } else {
                        1
                    },
                    health: HealthState::Ok,
                    replicas: replica_set,
                });
            }
        }

        SimulatedCluster {
            recovery: self.recovery,
            action_delay: self.action_delay,
            state: Mutex::new(SimState {
                nodes,
                partitions,
                in_flight: Vec::new(),
                pending: Vec::new(),
                failing_queries: 0,
                failing_actions: 0,
                health_reports: Vec::new(),
                executed: Vec::new(),
                issued: Vec::new(),
                interactions: 0,
                next_replica_id,
            }),
        }
    }
}

enum Recovery {
    Node(NodeId),
    Replica {
        partition: PartitionId,
        node: NodeId,
    },
    Recreate {
        partition: PartitionId,
        node: NodeId,
    },
}

struct SimState {
    nodes: Vec<NodeInfo>,
    partitions: Vec<PartitionInfo>,
    in_flight: Vec<InFlightMarker>,
    pending: Vec<(Instant, Recovery)>,
    failing_queries: u32,
    failing_actions: u32,
    health_reports: Vec<HealthReport>,
    executed: Vec<FaultAction>,
    issued: Vec<FaultAction>,
    interactions: u64,
    next_replica_id: ReplicaId,
}

pub struct SimulatedCluster {
    recovery: Option<Duration>,
    action_delay: Duration,
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    pub fn builder() -> SimulatedClusterBuilder {
        SimulatedClusterBuilder::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` node-list queries fail as unavailable.
    pub fn fail_next_queries(&self, count: u32) {
        self.lock().failing_queries = count;
    }

    /// Make the next `count` fault actions fail with a non-retriable error.
    pub fn fail_next_actions(&self, count: u32) {
        self.lock().failing_actions = count;
    }

    pub fn set_node_status(&self, node: &NodeId, status: NodeStatus) {
        let mut state = self.lock();
        if let Some(n) = state.nodes.iter_mut().find(|n| &n.id == node) {
            n.status = status;
            n.health = if status == NodeStatus::Up {
                HealthState::Ok
            } else {
                HealthState::Error
            };
        }
    }

    pub fn add_in_flight(&self, entity: EntityRef, description: &str) {
        self.lock().in_flight.push(InFlightMarker {
            entity,
            description: description.to_string(),
        });
    }

    pub fn health_reports(&self) -> Vec<HealthReport> {
        self.lock().health_reports.clone()
    }

    /// Fault actions applied so far, in order.
    pub fn executed_actions(&self) -> Vec<FaultAction> {
        self.lock().executed.clone()
    }

    /// Every fault action call received, including rejected ones.
    pub fn issued_actions(&self) -> Vec<FaultAction> {
        self.lock().issued.clone()
    }

    /// Number of collaborator calls received.
    pub fn interactions(&self) -> u64 {
        self.lock().interactions
    }

    /// Current topology, with due recoveries applied.
    pub fn snapshot(&self) -> ClusterStateSnapshot {
        let mut state = self.lock();
        state.apply_due_recoveries(Instant::now());
        ClusterStateSnapshot::new(
            state.nodes.clone(),
            state.partitions.clone(),
            state.in_flight.clone(),
        )
    }

    fn fault_error(code: ClusterErrorCode, message: String) -> ClusterError {
        ClusterError::operation(code, message)
    }
}

impl SimState {
    fn apply_due_recoveries(&mut self, now: Instant) {
        let pending = std::mem::take(&mut self.pending);
        let (due, later): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(at, _)| *at <= now);
        self.pending = later;
        for (_, recovery) in due {
            self.recover(recovery);
        }
    }

    fn recover(&mut self, recovery: Recovery) {
        match recovery {
            Recovery::Node(node) => {
                if let Some(n) = self.nodes.iter_mut().find(|n| n.id == node) {
                    n.status = NodeStatus::Up;
                    n.health = HealthState::Ok;
                }
                let pids: Vec<PartitionId> = self
                    .partitions
                    .iter()
                    .filter(|p| p.replica_on(&node).is_some())
                    .map(|p| p.id)
                    .collect();
                for pid in pids {
                    self.set_replica_status(pid, &node, ReplicaStatus::Ready);
                }
            }
            Recovery::Replica { partition, node } => {
                self.set_replica_status(partition, &node, ReplicaStatus::Ready);
            }
            Recovery::Recreate { partition, node } => {
                let id = self.next_replica_id;
                self.next_replica_id += 1;
                if let Some(p) = self.partitions.iter_mut().find(|p| p.id == partition) {
                    let role = if !p.is_stateful {
                        ReplicaRole::None
                    } else if p.primary().is_none() {
                        ReplicaRole::Primary
                    } else {
                        ReplicaRole::ActiveSecondary
                    };
                    p.replicas.push(ReplicaInfo {
                        id,
                        node,
                        role,
                        status: ReplicaStatus::Ready,
                        health: HealthState::Ok,
                    });
                    refresh_partition_health(p);
                }
            }
        }
    }

    fn set_replica_status(&mut self, partition: PartitionId, node: &NodeId, status: ReplicaStatus) {
        let Some(p) = self.partitions.iter_mut().find(|p| p.id == partition) else {
            return;
        };
        let primaries = p
            .replicas
            .iter()
            .filter(|r| r.role == ReplicaRole::Primary)
            .count();
        if let Some(r) = p.replicas.iter_mut().find(|r| &r.node == node) {
            r.status = status;
            r.health = if status == ReplicaStatus::Ready {
                HealthState::Ok
            } else {
                HealthState::Error
            };
            // A failed-over primary rejoins as a secondary.
            if status == ReplicaStatus::Ready && r.role == ReplicaRole::Primary && primaries > 1 {
                r.role = ReplicaRole::ActiveSecondary;
            }
        }
        if p.is_stateful && p.primary().is_none() {
            promote_secondary(p);
        }
        refresh_partition_health(p);
    }

    fn node_is_up(&self, node: &NodeId) -> Result<(), ClusterError> {
        match self.nodes.iter().find(|n| &n.id == node) {
            None => Err(SimulatedCluster::fault_error(
                ClusterErrorCode::NodeNotFound,
                format!("node {node} not found"),
            )),
            Some(n) if !n.is_up() => Err(SimulatedCluster::fault_error(
                ClusterErrorCode::NodeIsDown,
                format!("node {node} is {}", n.status),
            )),
            Some(_) => Ok(()),
        }
    }

    fn ready_replica(
        &self,
        partition: PartitionId,
        node: &NodeId,
    ) -> Result<&ReplicaInfo, ClusterError> {
        let p = self
            .partitions
            .iter()
            .find(|p| p.id == partition)
            .ok_or_else(|| {
                SimulatedCluster::fault_error(
                    ClusterErrorCode::PartitionNotFound,
                    format!("partition {partition} not found"),
                )
            })?;
        let r = p.replica_on(node).ok_or_else(|| {
            SimulatedCluster::fault_error(
                ClusterErrorCode::InvalidArgument,
                format!("partition {partition} has no replica on {node}"),
            )
        })?;
        if !r.is_ready() {
            return Err(SimulatedCluster::fault_error(
                ClusterErrorCode::InvalidReplicaStateForReplicaOperation,
                format!("replica {} of {partition} is {:?}", r.id, r.status),
            ));
        }
        Ok(r)
    }

    /// Apply `action`, returning what must recover later.
    fn apply(&mut self, action: &FaultAction) -> Result<Vec<Recovery>, ClusterError> {
        match action {
            FaultAction::RestartNode { node } => {
                self.node_is_up(node)?;
                if let Some(n) = self.nodes.iter_mut().find(|n| &n.id == node) {
                    n.status = NodeStatus::Down;
                    n.health = HealthState::Error;
                }
                let pids: Vec<PartitionId> = self
                    .partitions
                    .iter()
                    .filter(|p| p.replica_on(node).is_some())
                    .map(|p| p.id)
                    .collect();
                for pid in pids {
                    self.set_replica_status(pid, node, ReplicaStatus::Down);
                }
                Ok(vec![Recovery::Node(node.clone())])
            }
            FaultAction::RestartCodePackage { node, application } => {
                self.node_is_up(node)?;
                let pids: Vec<PartitionId> = self
                    .partitions
                    .iter()
                    .filter(|p| &p.application_name == application && p.replica_on(node).is_some())
                    .map(|p| p.id)
                    .collect();
                if pids.is_empty() {
                    return Err(SimulatedCluster::fault_error(
                        ClusterErrorCode::InvalidArgument,
                        format!("no code package of {application} on {node}"),
                    ));
                }
                let mut recoveries = Vec::new();
                for pid in pids {
                    self.set_replica_status(pid, node, ReplicaStatus::Down);
                    recoveries.push(Recovery::Replica {
                        partition: pid,
                        node: node.clone(),
                    });
                }
                Ok(recoveries)
            }
            FaultAction::RestartReplica { partition, node } => {
                self.ready_replica(*partition, node)?;
                self.set_replica_status(*partition, node, ReplicaStatus::Down);
                Ok(vec![Recovery::Replica {
                    partition: *partition,
                    node: node.clone(),
                }])
            }
            FaultAction::RemoveReplica { partition, node } => {
                self.ready_replica(*partition, node)?;
                if let Some(p) = self.partitions.iter_mut().find(|p| &p.id == partition) {
                    p.replicas.retain(|r| &r.node != node);
                    if p.is_stateful && p.primary().is_none() {
                        promote_secondary(p);
                    }
                    refresh_partition_health(p);
                }
                Ok(vec![Recovery::Recreate {
                    partition: *partition,
                    node: node.clone(),
                }])
            }
            FaultAction::MovePrimary {
                partition,
                from,
                to,
            }
            | FaultAction::MoveSecondary {
                partition,
                from,
                to,
            } => {
                let role = self.ready_replica(*partition, from)?.role;
                let wants_primary = matches!(action, FaultAction::MovePrimary { .. });
                if wants_primary != (role == ReplicaRole::Primary) {
                    return Err(SimulatedCluster::fault_error(
                        ClusterErrorCode::NotPrimary,
                        format!("replica on {from} is {role:?}"),
                    ));
                }
                self.node_is_up(to)?;
                let Some(p) = self.partitions.iter_mut().find(|p| &p.id == partition) else {
                    return Ok(Vec::new());
                };
                if p.replica_on(to).is_some() {
                    return Err(SimulatedCluster::fault_error(
                        ClusterErrorCode::AlreadyInTargetState,
                        format!("partition {partition} already has a replica on {to}"),
                    ));
                }
                if let Some(r) = p.replicas.iter_mut().find(|r| &r.node == from) {
                    r.node = to.clone();
                }
                Ok(Vec::new())
            }
        }
    }
}

fn promote_secondary(p: &mut PartitionInfo) {
    if let Some(r) = p
        .replicas
        .iter_mut()
        .find(|r| r.role == ReplicaRole::ActiveSecondary && r.is_ready())
    {
        r.role = ReplicaRole::Primary;
    }
}

fn refresh_partition_health(p: &mut PartitionInfo) {
    p.health = if p.ready_replicas() >= p.target_replica_set_size as usize {
        HealthState::Ok
    } else {
        HealthState::Warning
    };
}

fn unavailable() -> ClusterError {
    ClusterError::Unavailable("simulated gateway failure".to_string())
}

#[async_trait]
impl ClusterQueryClient for SimulatedCluster {
    async fn get_node_list(&self, _timeout: Duration) -> Result<Vec<NodeInfo>, ClusterError> {
        let mut state = self.lock();
        state.interactions += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(unavailable());
        }
        state.apply_due_recoveries(Instant::now());
        Ok(state.nodes.clone())
    }

    async fn get_partition_list(
        &self,
        _timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ClusterError> {
        let mut state = self.lock();
        state.interactions += 1;
        Ok(state.partitions.clone())
    }

    async fn get_in_flight_markers(
        &self,
        _timeout: Duration,
    ) -> Result<Vec<InFlightMarker>, ClusterError> {
        let mut state = self.lock();
        state.interactions += 1;
        Ok(state.in_flight.clone())
    }
}

#[async_trait]
impl HealthClient for SimulatedCluster {
    async fn report_health(&self, report: HealthReport) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.interactions += 1;
        debug!(state = %report.state, "Simulated cluster received health report");
        state.health_reports.push(report);
        Ok(())
    }
}

#[async_trait]
impl FaultActionClient for SimulatedCluster {
    async fn execute(
        &self,
        action: &FaultAction,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(), ClusterError> {
        self.lock().interactions += 1;
        if cancel.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        self.lock().issued.push(action.clone());
        // Once issued, the action runs to completion.
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }

        let mut state = self.lock();
        if state.failing_actions > 0 {
            state.failing_actions -= 1;
            return Err(ClusterError::operation(
                ClusterErrorCode::AccessDenied,
                format!("simulated rejection of {action}"),
            ));
        }
        let recoveries = state.apply(action)?;
        state.executed.push(action.clone());
        if let Some(delay) = self.recovery {
            let at = Instant::now() + delay;
            state
                .pending
                .extend(recoveries.into_iter().map(|r| (at, r)));
        }
        info!(action = %action, "Simulated fault applied");
        Ok(())
    }
}
