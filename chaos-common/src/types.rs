//! Common types used across chaos engine components.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a service partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub Uuid);

impl PartitionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica (or stateless instance) identifier, unique within a partition.
pub type ReplicaId = i64;

/// Lifecycle state of a node as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is up and participating.
    Up,
    /// Node is down.
    Down,
    /// Node is coming back up.
    Enabling,
    /// Node is being deactivated.
    Disabling,
    /// Node has been deactivated.
    Disabled,
    /// Cluster could not determine the status.
    Unknown,
}

impl NodeStatus {
    /// Whether the node is in the middle of a state change.
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Enabling | Self::Disabling | Self::Unknown)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Enabling => write!(f, "enabling"),
            Self::Disabling => write!(f, "disabling"),
            Self::Disabled => write!(f, "disabled"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Aggregated health of an entity, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Ok,
    Warning,
    Error,
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Role of a replica within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    ActiveSecondary,
    IdleSecondary,
    /// Stateless instance.
    None,
}

/// Lifecycle status of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Ready,
    InBuild,
    Standby,
    Down,
    Dropped,
}

impl ReplicaStatus {
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::InBuild | Self::Standby)
    }
}

/// A cluster entity that a fault may touch. Used for batch non-overlap checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Node(NodeId),
    Partition(PartitionId),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node:{id}"),
            Self::Partition(id) => write!(f, "partition:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_ordering_is_best_to_worst() {
        assert!(HealthState::Ok < HealthState::Warning);
        assert!(HealthState::Warning < HealthState::Error);
        assert_eq!(
            [HealthState::Warning, HealthState::Ok].iter().max(),
            Some(&HealthState::Warning)
        );
    }

    #[test]
    fn test_transitioning_statuses() {
        assert!(NodeStatus::Enabling.is_transitioning());
        assert!(!NodeStatus::Up.is_transitioning());
        assert!(!NodeStatus::Down.is_transitioning());
        assert!(ReplicaStatus::InBuild.is_transitioning());
        assert!(!ReplicaStatus::Ready.is_transitioning());
    }

    #[test]
    fn test_entity_ref_serializes_tagged() {
        let node = EntityRef::Node(NodeId::new("N1"));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "node");
        assert_eq!(json["id"], "N1");
    }
}
