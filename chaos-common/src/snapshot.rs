//! Immutable point-in-time view of cluster topology and health.
//!
//! Snapshots are captured fresh every iteration and never mutated. A pair of
//! snapshots (before and after a fault batch) is compared with
//! [`ClusterStateSnapshot::diff`].

use crate::errors::SnapshotRef;
use crate::parameters::ClusterHealthPolicy;
use crate::types::{
    EntityRef, HealthState, NodeId, NodeStatus, PartitionId, ReplicaId, ReplicaRole, ReplicaStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_type: String,
    pub status: NodeStatus,
    pub health: HealthState,
    #[serde(default)]
    pub is_seed: bool,
}

impl NodeInfo {
    pub fn is_up(&self) -> bool {
        self.status == NodeStatus::Up
    }
}

/// A replica (or stateless instance) of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub node: NodeId,
    pub role: ReplicaRole,
    pub status: ReplicaStatus,
    pub health: HealthState,
}

impl ReplicaInfo {
    pub fn is_ready(&self) -> bool {
        self.status == ReplicaStatus::Ready
    }
}

/// A service partition and its replica placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub application_name: String,
    pub service_name: String,
    #[serde(default)]
    pub is_system: bool,
    pub is_stateful: bool,
    pub target_replica_set_size: u32,
    pub min_replica_set_size: u32,
    pub health: HealthState,
    pub replicas: Vec<ReplicaInfo>,
}

impl PartitionInfo {
    /// Write quorum for a stateful partition.
    pub fn quorum(&self) -> usize {
        self.target_replica_set_size as usize / 2 + 1
    }

    pub fn ready_replicas(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_ready()).count()
    }

    pub fn primary(&self) -> Option<&ReplicaInfo> {
        self.replicas
            .iter()
            .find(|r| r.role == ReplicaRole::Primary && r.is_ready())
    }

    pub fn replica_on(&self, node: &NodeId) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| &r.node == node)
    }

    /// Whether the partition stays available after losing `lost` ready replicas.
    ///
    /// Stateful partitions must keep write quorum; stateless ones must keep at
    /// least one instance.
    pub fn tolerates_loss_of(&self, lost: usize) -> bool {
        let ready = self.ready_replicas();
        if ready < lost {
            return false;
        }
        let remaining = ready - lost;
        if self.is_stateful {
            remaining >= self.quorum()
        } else {
            remaining >= 1
        }
    }

    /// Whether the partition can lose one ready replica.
    pub fn is_fault_tolerant(&self) -> bool {
        self.tolerates_loss_of(1)
    }

    pub fn has_transitioning_replica(&self) -> bool {
        self.replicas.iter().any(|r| r.status.is_transitioning())
    }
}

/// Marker for an operation already in progress against an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightMarker {
    pub entity: EntityRef,
    pub description: String,
}

/// Point-in-time view of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub nodes: Vec<NodeInfo>,
    pub partitions: Vec<PartitionInfo>,
    #[serde(default)]
    pub in_flight: Vec<InFlightMarker>,
}

impl ClusterStateSnapshot {
    pub fn new(
        nodes: Vec<NodeInfo>,
        partitions: Vec<PartitionInfo>,
        in_flight: Vec<InFlightMarker>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            nodes,
            partitions,
            in_flight,
        }
    }

    pub fn reference(&self) -> SnapshotRef {
        SnapshotRef {
            id: self.id,
            captured_at: self.captured_at,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn partition(&self, id: &PartitionId) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| &p.id == id)
    }

    pub fn up_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| n.is_up())
    }

    /// Partitions with a replica placed on `node`.
    pub fn partitions_on_node<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = &'a PartitionInfo> + 'a {
        self.partitions
            .iter()
            .filter(move |p| p.replicas.iter().any(|r| &r.node == node))
    }

    /// Partitions with a replica of `application` placed on `node`.
    pub fn application_partitions_on_node<'a>(
        &'a self,
        node: &'a NodeId,
        application: &'a str,
    ) -> impl Iterator<Item = &'a PartitionInfo> + 'a {
        self.partitions_on_node(node)
            .filter(move |p| p.application_name == application)
    }

    /// Smallest number of up nodes that still forms a cluster majority.
    pub fn node_majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn node_types(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.node_type.as_str()).collect()
    }

    /// Whether `entity` is changing state or has an operation in flight.
    pub fn is_transitioning(&self, entity: &EntityRef) -> bool {
        if self.in_flight.iter().any(|m| &m.entity == entity) {
            return true;
        }
        match entity {
            EntityRef::Node(id) => self.node(id).is_none_or(|n| n.status.is_transitioning()),
            EntityRef::Partition(id) => self
                .partition(id)
                .is_none_or(|p| p.has_transitioning_replica()),
        }
    }

    /// Aggregate health under `policy`.
    pub fn evaluate_health(&self, policy: &ClusterHealthPolicy) -> HealthEvaluation {
        let is_bad = |h: HealthState| match h {
            HealthState::Ok => false,
            HealthState::Warning => policy.consider_warning_as_error,
            HealthState::Error | HealthState::Unknown => true,
        };

        let unhealthy_nodes: Vec<&NodeInfo> = self
            .nodes
            .iter()
            .filter(|n| !n.is_up() || is_bad(n.health))
            .collect();

        let mut apps: BTreeMap<&str, bool> = BTreeMap::new();
        let mut unhealthy_partitions = Vec::new();
        for p in &self.partitions {
            let bad = is_bad(p.health) || p.ready_replicas() < p.target_replica_set_size as usize;
            if bad {
                unhealthy_partitions.push(p.id);
            }
            let entry = apps.entry(p.application_name.as_str()).or_insert(false);
            *entry |= bad;
        }
        let unhealthy_apps = apps.values().filter(|bad| **bad).count();

        let nodes_over = exceeds_percent(
            unhealthy_nodes.len(),
            self.nodes.len(),
            policy.max_percent_unhealthy_nodes,
        );
        let apps_over = exceeds_percent(
            unhealthy_apps,
            apps.len(),
            policy.max_percent_unhealthy_applications,
        );

        let mut unhealthy: Vec<EntityRef> = unhealthy_nodes
            .iter()
            .map(|n| EntityRef::Node(n.id.clone()))
            .collect();
        unhealthy.extend(unhealthy_partitions.into_iter().map(EntityRef::Partition));

        let state = if nodes_over || apps_over {
            HealthState::Error
        } else if unhealthy.is_empty() {
            HealthState::Ok
        } else {
            HealthState::Warning
        };

        HealthEvaluation { state, unhealthy }
    }

    /// Compare this (pre) snapshot with a later one.
    pub fn diff(&self, post: &ClusterStateSnapshot) -> SnapshotDiff {
        let mut nodes = Vec::new();
        let ids: BTreeSet<&NodeId> = self.nodes.iter().chain(&post.nodes).map(|n| &n.id).collect();
        for id in ids {
            let before = self.node(id);
            let after = post.node(id);
            let changed = match (before, after) {
                (Some(b), Some(a)) => b.status != a.status || b.health != a.health,
                _ => true,
            };
            if changed {
                nodes.push(NodeChange {
                    node: id.clone(),
                    status_before: before.map(|n| n.status),
                    status_after: after.map(|n| n.status),
                    health_before: before.map(|n| n.health),
                    health_after: after.map(|n| n.health),
                });
            }
        }

        let mut partitions = Vec::new();
        for b in &self.partitions {
            let after = post.partition(&b.id);
            let (health_after, ready_after) = match after {
                Some(a) => (Some(a.health), a.ready_replicas()),
                None => (None, 0),
            };
            if health_after != Some(b.health) || ready_after != b.ready_replicas() {
                partitions.push(PartitionChange {
                    partition: b.id,
                    health_before: b.health,
                    health_after,
                    ready_before: b.ready_replicas(),
                    ready_after,
                });
            }
        }

        SnapshotDiff {
            pre: self.reference(),
            post: post.reference(),
            nodes,
            partitions,
        }
    }
}

fn exceeds_percent(unhealthy: usize, total: usize, max_percent: u8) -> bool {
    if total == 0 {
        return false;
    }
    unhealthy * 100 > usize::from(max_percent) * total
}

/// Result of evaluating a snapshot against a health policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvaluation {
    pub state: HealthState,
    pub unhealthy: Vec<EntityRef>,
}

impl HealthEvaluation {
    /// Within the policy's tolerance.
    pub fn is_healthy(&self) -> bool {
        self.state != HealthState::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeChange {
    pub node: NodeId,
    pub status_before: Option<NodeStatus>,
    pub status_after: Option<NodeStatus>,
    pub health_before: Option<HealthState>,
    pub health_after: Option<HealthState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionChange {
    pub partition: PartitionId,
    pub health_before: HealthState,
    pub health_after: Option<HealthState>,
    pub ready_before: usize,
    pub ready_after: usize,
}

/// Differences between a pre and post snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub pre: SnapshotRef,
    pub post: SnapshotRef,
    pub nodes: Vec<NodeChange>,
    pub partitions: Vec<PartitionChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.partitions.is_empty()
    }

    /// Whether any entity ended in worse health than it started.
    pub fn has_regression(&self) -> bool {
        let node_worse = self.nodes.iter().any(|c| match (c.health_before, c.health_after) {
            (Some(b), Some(a)) => a > b,
            (Some(_), None) => true,
            _ => false,
        });
        let partition_worse = self
            .partitions
            .iter()
            .any(|c| {
                c.health_after.is_none_or(|a| a > c.health_before) || c.ready_after < c.ready_before
            });
        node_worse || partition_worse
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for c in &self.nodes {
            parts.push(format!(
                "node {}: {} -> {}",
                c.node,
                c.status_before.map_or("absent".to_string(), |s| s.to_string()),
                c.status_after.map_or("absent".to_string(), |s| s.to_string()),
            ));
        }
        for c in &self.partitions {
            parts.push(format!(
                "partition {}: {} ready -> {} ready ({} -> {})",
                c.partition,
                c.ready_before,
                c.ready_after,
                c.health_before,
                c.health_after.map_or("absent".to_string(), |h| h.to_string()),
            ));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn node(id: &str, status: NodeStatus) -> NodeInfo {
        NodeInfo {
            id: NodeId::new(id),
            node_type: "NodeType0".to_string(),
            status,
            health: if status == NodeStatus::Up {
                HealthState::Ok
            } else {
                HealthState::Error
            },
            is_seed: false,
        }
    }

    pub fn stateful_partition(app: &str, nodes: &[&str]) -> PartitionInfo {
        let replicas = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| ReplicaInfo {
                id: i as ReplicaId + 1,
                node: NodeId::new(*n),
                role: if i == 0 {
                    ReplicaRole::Primary
                } else {
                    ReplicaRole::ActiveSecondary
                },
                status: ReplicaStatus::Ready,
                health: HealthState::Ok,
            })
            .collect::<Vec<_>>();
        PartitionInfo {
            id: PartitionId::new_v4(),
            application_name: app.to_string(),
            service_name: format!("{app}/svc"),
            is_system: false,
            is_stateful: true,
            target_replica_set_size: replicas.len() as u32,
            min_replica_set_size: (replicas.len() as u32 / 2 + 1).min(replicas.len() as u32),
            health: HealthState::Ok,
            replicas,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn healthy_cluster() -> ClusterStateSnapshot {
        ClusterStateSnapshot::new(
            vec![
                node("N1", NodeStatus::Up),
                node("N2", NodeStatus::Up),
                node("N3", NodeStatus::Up),
            ],
            vec![stateful_partition("fabric:/App", &["N1", "N2", "N3"])],
            vec![],
        )
    }

    #[test]
    fn test_quorum_and_fault_tolerance() {
        let p = stateful_partition("fabric:/App", &["N1", "N2", "N3"]);
        assert_eq!(p.quorum(), 2);
        assert!(p.is_fault_tolerant());
        assert!(!p.tolerates_loss_of(2));

        let single = stateful_partition("fabric:/App", &["N1"]);
        assert!(!single.is_fault_tolerant());
    }

    #[test]
    fn test_stateless_tolerance_needs_two_instances() {
        let mut p = stateful_partition("fabric:/Web", &["N1", "N2"]);
        p.is_stateful = false;
        assert!(p.is_fault_tolerant());
        p.replicas.truncate(1);
        assert!(!p.is_fault_tolerant());
    }

    #[test]
    fn test_healthy_cluster_evaluates_ok() {
        let snap = healthy_cluster();
        let eval = snap.evaluate_health(&ClusterHealthPolicy::default());
        assert_eq!(eval.state, HealthState::Ok);
        assert!(eval.is_healthy());
    }

    #[test]
    fn test_down_node_is_error_under_default_policy() {
        let mut snap = healthy_cluster();
        snap.nodes[1] = node("N2", NodeStatus::Down);
        let eval = snap.evaluate_health(&ClusterHealthPolicy::default());
        assert_eq!(eval.state, HealthState::Error);
        assert!(eval.unhealthy.contains(&EntityRef::Node(NodeId::new("N2"))));
    }

    #[test]
    fn test_warning_tolerated_when_policy_allows() {
        let mut snap = healthy_cluster();
        snap.nodes[0].health = HealthState::Warning;
        let strict = snap.evaluate_health(&ClusterHealthPolicy::default());
        assert_eq!(strict.state, HealthState::Error);

        let lenient = ClusterHealthPolicy {
            consider_warning_as_error: false,
            ..ClusterHealthPolicy::default()
        };
        assert_eq!(snap.evaluate_health(&lenient).state, HealthState::Ok);
    }

    #[test]
    fn test_percent_unhealthy_threshold() {
        let mut snap = healthy_cluster();
        snap.nodes[2] = node("N3", NodeStatus::Down);
        let policy = ClusterHealthPolicy {
            max_percent_unhealthy_nodes: 40,
            max_percent_unhealthy_applications: 100,
            ..ClusterHealthPolicy::default()
        };
        let eval = snap.evaluate_health(&policy);
        assert_eq!(eval.state, HealthState::Warning);
        assert!(eval.is_healthy());
    }

    #[test]
    fn test_transitioning_detection() {
        let mut snap = healthy_cluster();
        let pid = snap.partitions[0].id;
        assert!(!snap.is_transitioning(&EntityRef::Partition(pid)));
        snap.partitions[0].replicas[1].status = ReplicaStatus::InBuild;
        assert!(snap.is_transitioning(&EntityRef::Partition(pid)));

        snap.nodes[0].status = NodeStatus::Disabling;
        assert!(snap.is_transitioning(&EntityRef::Node(NodeId::new("N1"))));

        snap.in_flight.push(InFlightMarker {
            entity: EntityRef::Node(NodeId::new("N2")),
            description: "restart".into(),
        });
        assert!(snap.is_transitioning(&EntityRef::Node(NodeId::new("N2"))));
        assert!(!snap.is_transitioning(&EntityRef::Node(NodeId::new("N3"))));
    }

    #[test]
    fn test_diff_reports_regression() {
        let pre = healthy_cluster();
        let mut post = pre.clone();
        post.id = Uuid::new_v4();
        post.nodes[0] = node("N1", NodeStatus::Down);
        post.partitions[0].replicas[0].status = ReplicaStatus::Down;

        let diff = pre.diff(&post);
        assert!(!diff.is_empty());
        assert!(diff.has_regression());
        assert!(diff.summary().contains("node N1: up -> down"));

        let same = pre.diff(&pre.clone());
        assert!(same.is_empty());
        assert!(!same.has_regression());
        assert_eq!(same.summary(), "no changes");
    }
}
