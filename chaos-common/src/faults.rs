//! Fault actions the engine can inject.

use crate::snapshot::ClusterStateSnapshot;
use crate::types::{EntityRef, NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single injected failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultAction {
    RestartNode {
        node: NodeId,
    },
    RestartCodePackage {
        node: NodeId,
        application: String,
    },
    RestartReplica {
        partition: PartitionId,
        node: NodeId,
    },
    RemoveReplica {
        partition: PartitionId,
        node: NodeId,
    },
    MovePrimary {
        partition: PartitionId,
        from: NodeId,
        to: NodeId,
    },
    MoveSecondary {
        partition: PartitionId,
        from: NodeId,
        to: NodeId,
    },
}

/// Discriminant of [`FaultAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    RestartNode,
    RestartCodePackage,
    RestartReplica,
    RemoveReplica,
    MovePrimary,
    MoveSecondary,
}

impl FaultKind {
    pub fn is_move(self) -> bool {
        matches!(self, Self::MovePrimary | Self::MoveSecondary)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestartNode => write!(f, "restart_node"),
            Self::RestartCodePackage => write!(f, "restart_code_package"),
            Self::RestartReplica => write!(f, "restart_replica"),
            Self::RemoveReplica => write!(f, "remove_replica"),
            Self::MovePrimary => write!(f, "move_primary"),
            Self::MoveSecondary => write!(f, "move_secondary"),
        }
    }
}

impl FaultAction {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::RestartNode { .. } => FaultKind::RestartNode,
            Self::RestartCodePackage { .. } => FaultKind::RestartCodePackage,
            Self::RestartReplica { .. } => FaultKind::RestartReplica,
            Self::RemoveReplica { .. } => FaultKind::RemoveReplica,
            Self::MovePrimary { .. } => FaultKind::MovePrimary,
            Self::MoveSecondary { .. } => FaultKind::MoveSecondary,
        }
    }

    /// Node the fault lands on (the source node for moves).
    pub fn node(&self) -> &NodeId {
        match self {
            Self::RestartNode { node }
            | Self::RestartCodePackage { node, .. }
            | Self::RestartReplica { node, .. }
            | Self::RemoveReplica { node, .. } => node,
            Self::MovePrimary { from, .. } | Self::MoveSecondary { from, .. } => from,
        }
    }

    /// Every cluster entity this fault touches.
    ///
    /// Node-wide faults include each partition with a replica on the node, so
    /// two faults in one batch never affect the same partition indirectly.
    pub fn targets(&self, snapshot: &ClusterStateSnapshot) -> BTreeSet<EntityRef> {
        let mut set = BTreeSet::new();
        match self {
            Self::RestartNode { node } => {
                set.insert(EntityRef::Node(node.clone()));
                set.extend(
                    snapshot
                        .partitions_on_node(node)
                        .map(|p| EntityRef::Partition(p.id)),
                );
            }
            Self::RestartCodePackage { node, application } => {
                set.insert(EntityRef::Node(node.clone()));
                set.extend(
                    snapshot
                        .application_partitions_on_node(node, application)
                        .map(|p| EntityRef::Partition(p.id)),
                );
            }
            Self::RestartReplica { partition, node } | Self::RemoveReplica { partition, node } => {
                set.insert(EntityRef::Partition(*partition));
                set.insert(EntityRef::Node(node.clone()));
            }
            Self::MovePrimary {
                partition,
                from,
                to,
            }
            | Self::MoveSecondary {
                partition,
                from,
                to,
            } => {
                set.insert(EntityRef::Partition(*partition));
                set.insert(EntityRef::Node(from.clone()));
                set.insert(EntityRef::Node(to.clone()));
            }
        }
        set
    }
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestartNode { node } => write!(f, "RestartNode(node={node})"),
            Self::RestartCodePackage { node, application } => {
                write!(f, "RestartCodePackage(node={node}, application={application})")
            }
            Self::RestartReplica { partition, node } => {
                write!(f, "RestartReplica(partition={partition}, node={node})")
            }
            Self::RemoveReplica { partition, node } => {
                write!(f, "RemoveReplica(partition={partition}, node={node})")
            }
            Self::MovePrimary {
                partition,
                from,
                to,
            } => write!(f, "MovePrimary(partition={partition}, from={from}, to={to})"),
            Self::MoveSecondary {
                partition,
                from,
                to,
            } => write!(f, "MoveSecondary(partition={partition}, from={from}, to={to})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures::{node, stateful_partition};
    use crate::types::NodeStatus;

    #[test]
    fn test_node_restart_targets_hosted_partitions() {
        let p1 = stateful_partition("fabric:/A", &["N1", "N2", "N3"]);
        let p2 = stateful_partition("fabric:/B", &["N2", "N3", "N4"]);
        let snap = ClusterStateSnapshot::new(
            ["N1", "N2", "N3", "N4"]
                .iter()
                .map(|n| node(n, NodeStatus::Up))
                .collect(),
            vec![p1.clone(), p2.clone()],
            vec![],
        );

        let targets = FaultAction::RestartNode {
            node: NodeId::new("N1"),
        }
        .targets(&snap);
        assert!(targets.contains(&EntityRef::Node(NodeId::new("N1"))));
        assert!(targets.contains(&EntityRef::Partition(p1.id)));
        assert!(!targets.contains(&EntityRef::Partition(p2.id)));
    }

    #[test]
    fn test_move_targets_both_nodes() {
        let p = stateful_partition("fabric:/A", &["N1", "N2", "N3"]);
        let snap = ClusterStateSnapshot::new(vec![], vec![p.clone()], vec![]);
        let action = FaultAction::MovePrimary {
            partition: p.id,
            from: NodeId::new("N1"),
            to: NodeId::new("N4"),
        };
        let targets = action.targets(&snap);
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&EntityRef::Node(NodeId::new("N4"))));
        assert_eq!(action.kind(), FaultKind::MovePrimary);
        assert!(action.kind().is_move());
        assert_eq!(action.node(), &NodeId::new("N1"));
    }

    #[test]
    fn test_display_and_serde() {
        let action = FaultAction::RestartNode {
            node: NodeId::new("N7"),
        };
        assert_eq!(action.to_string(), "RestartNode(node=N7)");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "restart_node");
        assert_eq!(json["node"], "N7");
    }
}
