//! Fault action selection.
//!
//! [`FaultActionSelector::select_next`] builds every individually safe
//! candidate from a snapshot, shuffles them with a seeded RNG and picks
//! greedily. A candidate is taken only if its targets are disjoint from every
//! earlier pick and it is still safe on the cluster as projected after the
//! earlier picks.

use chaos_common::{
    ChaosTargetFilter, ClusterStateSnapshot, EntityRef, FaultAction, NodeId, NodeInfo,
    PartitionId, PartitionInfo, ReplicaRole,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Switches that widen or narrow the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionOptions {
    pub enable_move_replica_faults: bool,
    pub force_move_replica: bool,
    pub fault_system_services: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            enable_move_replica_faults: true,
            force_move_replica: false,
            fault_system_services: false,
        }
    }
}

impl SelectionOptions {
    fn moves_allowed(&self) -> bool {
        self.enable_move_replica_faults || self.force_move_replica
    }
}

pub struct FaultActionSelector {
    rng: fastrand::Rng,
}

impl FaultActionSelector {
    /// Seeded selector; an unset seed draws one from entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { rng }
    }

    /// Pick up to `max_concurrent` non-overlapping, jointly safe faults.
    ///
    /// Returns an empty list when nothing is eligible.
    pub fn select_next(
        &mut self,
        snapshot: &ClusterStateSnapshot,
        max_concurrent: u32,
        filter: Option<&ChaosTargetFilter>,
        options: SelectionOptions,
    ) -> Vec<FaultAction> {
        let mut candidates = self.candidates(snapshot, filter, options);
        self.rng.shuffle(&mut candidates);

        let mut projected = ProjectedCluster::new(snapshot);
        let mut used: BTreeSet<EntityRef> = BTreeSet::new();
        let mut picked = Vec::new();

        for candidate in candidates {
            if picked.len() >= max_concurrent as usize {
                break;
            }
            let targets = candidate.targets(snapshot);
            if targets.iter().any(|t| used.contains(t)) {
                continue;
            }
            if !projected.is_safe(&candidate) {
                continue;
            }
            projected.apply(&candidate);
            used.extend(targets);
            picked.push(candidate);
        }

        debug!(
            selected = picked.len(),
            max_concurrent, "Selected fault actions"
        );
        picked
    }

    fn candidates(
        &mut self,
        snapshot: &ClusterStateSnapshot,
        filter: Option<&ChaosTargetFilter>,
        options: SelectionOptions,
    ) -> Vec<FaultAction> {
        let node_ok = |n: &NodeInfo| {
            n.is_up()
                && !snapshot.is_transitioning(&EntityRef::Node(n.id.clone()))
                && filter.is_none_or(|f| f.allows_node_type(&n.node_type))
        };
        let partition_ok = |p: &PartitionInfo| {
            (!p.is_system || options.fault_system_services)
                && !snapshot.is_transitioning(&EntityRef::Partition(p.id))
                && filter.is_none_or(|f| f.allows_application(&p.application_name))
        };
        let eligible_nodes: HashSet<&NodeId> = snapshot
            .nodes
            .iter()
            .filter(|n| node_ok(n))
            .map(|n| &n.id)
            .collect();
        let protects_system = |node: &NodeId| {
            !options.fault_system_services
                && snapshot
                    .partitions_on_node(node)
                    .any(|p| p.is_system)
        };

        let mut out = Vec::new();

        // Node-wide faults.
        if filter.is_none_or(ChaosTargetFilter::allows_node_faults) {
            for node in snapshot.nodes.iter().filter(|n| eligible_nodes.contains(&n.id)) {
                if protects_system(&node.id) {
                    continue;
                }
                out.push(FaultAction::RestartNode {
                    node: node.id.clone(),
                });
            }
        }

        // Code packages: one per (node, application) pair.
        let mut packages: BTreeSet<(NodeId, String)> = BTreeSet::new();
        for p in snapshot.partitions.iter().filter(|p| partition_ok(p)) {
            for r in &p.replicas {
                if eligible_nodes.contains(&r.node) {
                    packages.insert((r.node.clone(), p.application_name.clone()));
                }
            }
        }
        for (node, application) in packages {
            let hosts_blocked_partition = snapshot
                .application_partitions_on_node(&node, &application)
                .any(|p| !partition_ok(p));
            if !hosts_blocked_partition {
                out.push(FaultAction::RestartCodePackage { node, application });
            }
        }

        // Replica-level faults.
        let up_nodes: Vec<&NodeId> = snapshot
            .nodes
            .iter()
            .filter(|n| node_ok(n))
            .map(|n| &n.id)
            .collect();
        for p in snapshot.partitions.iter().filter(|p| partition_ok(p)) {
            if !p.is_fault_tolerant() {
                continue;
            }
            for r in p.replicas.iter().filter(|r| r.is_ready()) {
                if !eligible_nodes.contains(&r.node) {
                    continue;
                }
                out.push(FaultAction::RestartReplica {
                    partition: p.id,
                    node: r.node.clone(),
                });
                out.push(FaultAction::RemoveReplica {
                    partition: p.id,
                    node: r.node.clone(),
                });

                if !options.moves_allowed() || !p.is_stateful {
                    continue;
                }
                let destinations: Vec<&&NodeId> = up_nodes
                    .iter()
                    .filter(|n| p.replica_on(n).is_none())
                    .collect();
                if destinations.is_empty() {
                    continue;
                }
                let to = (*destinations[self.rng.usize(..destinations.len())]).clone();
                match r.role {
                    ReplicaRole::Primary => out.push(FaultAction::MovePrimary {
                        partition: p.id,
                        from: r.node.clone(),
                        to,
                    }),
                    ReplicaRole::ActiveSecondary => out.push(FaultAction::MoveSecondary {
                        partition: p.id,
                        from: r.node.clone(),
                        to,
                    }),
                    ReplicaRole::IdleSecondary | ReplicaRole::None => {}
                }
            }
        }

        out
    }
}

/// The cluster as it would look after the faults picked so far.
struct ProjectedCluster<'a> {
    snapshot: &'a ClusterStateSnapshot,
    down_nodes: HashSet<NodeId>,
    lost_replicas: HashMap<PartitionId, usize>,
}

impl<'a> ProjectedCluster<'a> {
    fn new(snapshot: &'a ClusterStateSnapshot) -> Self {
        Self {
            snapshot,
            down_nodes: HashSet::new(),
            lost_replicas: HashMap::new(),
        }
    }

    fn up_node_count(&self) -> usize {
        self.snapshot
            .up_nodes()
            .filter(|n| !self.down_nodes.contains(&n.id))
            .count()
    }

    /// Ready replicas each partition would lose from this fault.
    fn losses(&self, action: &FaultAction) -> Vec<PartitionId> {
        let hosted_ready = |p: &PartitionInfo, node: &NodeId| {
            p.replica_on(node).is_some_and(|r| r.is_ready())
        };
        match action {
            FaultAction::RestartNode { node } => self
                .snapshot
                .partitions_on_node(node)
                .filter(|p| hosted_ready(p, node))
                .map(|p| p.id)
                .collect(),
            FaultAction::RestartCodePackage { node, application } => self
                .snapshot
                .application_partitions_on_node(node, application)
                .filter(|p| hosted_ready(p, node))
                .map(|p| p.id)
                .collect(),
            FaultAction::RestartReplica { partition, .. }
            | FaultAction::RemoveReplica { partition, .. }
            | FaultAction::MovePrimary { partition, .. }
            | FaultAction::MoveSecondary { partition, .. } => vec![*partition],
        }
    }

    fn is_safe(&self, action: &FaultAction) -> bool {
        if self.down_nodes.contains(action.node()) {
            return false;
        }
        match action {
            FaultAction::RestartNode { .. } => {
                if self.up_node_count().saturating_sub(1) < self.snapshot.node_majority() {
                    return false;
                }
            }
            FaultAction::MovePrimary { to, .. } | FaultAction::MoveSecondary { to, .. } => {
                if self.down_nodes.contains(to) {
                    return false;
                }
            }
            _ => {}
        }
        self.losses(action).into_iter().all(|pid| {
            let already = self.lost_replicas.get(&pid).copied().unwrap_or(0);
            self.snapshot
                .partition(&pid)
                .is_some_and(|p| p.tolerates_loss_of(already + 1))
        })
    }

    fn apply(&mut self, action: &FaultAction) {
        for pid in self.losses(action) {
            *self.lost_replicas.entry(pid).or_insert(0) += 1;
        }
        if let FaultAction::RestartNode { node } = action {
            self.down_nodes.insert(node.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCluster;
    use chaos_common::{FaultKind, NodeStatus};
    use proptest::prelude::*;

    fn snapshot_of(sim: &SimulatedCluster) -> ClusterStateSnapshot {
        sim.snapshot()
    }

    #[test]
    fn test_three_healthy_nodes_yield_one_node_fault() {
        let sim = SimulatedCluster::builder().nodes(3).build();
        let snap = snapshot_of(&sim);
        let mut selector = FaultActionSelector::new(Some(7));
        let picked = selector.select_next(&snap, 1, None, SelectionOptions::default());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].kind(), FaultKind::RestartNode);
    }

    #[test]
    fn test_majority_protects_last_nodes() {
        let sim = SimulatedCluster::builder().nodes(3).build();
        let mut snap = snapshot_of(&sim);
        snap.nodes[0].status = NodeStatus::Down;
        let mut selector = FaultActionSelector::new(Some(1));
        let picked = selector.select_next(&snap, 3, None, SelectionOptions::default());
        assert!(picked.is_empty());
    }

    #[test]
    fn test_joint_node_restarts_respect_majority() {
        let sim = SimulatedCluster::builder().nodes(5).build();
        let snap = snapshot_of(&sim);
        let mut selector = FaultActionSelector::new(Some(3));
        let picked = selector.select_next(&snap, 5, None, SelectionOptions::default());
        // 5 nodes, majority 3: at most two may go down together.
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_same_seed_same_selection() {
        let sim = SimulatedCluster::builder()
            .nodes(6)
            .stateful_partitions(4, 3)
            .build();
        let snap = snapshot_of(&sim);
        let a = FaultActionSelector::new(Some(99)).select_next(
            &snap,
            3,
            None,
            SelectionOptions::default(),
        );
        let b = FaultActionSelector::new(Some(99)).select_next(
            &snap,
            3,
            None,
            SelectionOptions::default(),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_restricts_node_types() {
        let sim = SimulatedCluster::builder()
            .nodes_of_type(3, "Front")
            .nodes_of_type(3, "Back")
            .build();
        let snap = snapshot_of(&sim);
        let filter = ChaosTargetFilter {
            include_node_types: vec!["Back".into()],
            ..ChaosTargetFilter::default()
        };
        let mut selector = FaultActionSelector::new(Some(5));
        for _ in 0..20 {
            for action in selector.select_next(&snap, 2, Some(&filter), SelectionOptions::default())
            {
                let node = snap.node(action.node()).unwrap();
                assert_eq!(node.node_type, "Back");
            }
        }
    }

    #[test]
    fn test_moves_disabled_unless_forced() {
        let sim = SimulatedCluster::builder()
            .nodes(5)
            .stateful_partitions(3, 3)
            .build();
        let snap = snapshot_of(&sim);
        let disabled = SelectionOptions {
            enable_move_replica_faults: false,
            ..SelectionOptions::default()
        };
        let mut selector = FaultActionSelector::new(Some(11));
        for _ in 0..50 {
            let picked = selector.select_next(&snap, 3, None, disabled);
            assert!(picked.iter().all(|a| !a.kind().is_move()));
        }

        let forced = SelectionOptions {
            force_move_replica: true,
            ..disabled
        };
        let found_move = (0..200).any(|_| {
            selector
                .select_next(&snap, 3, None, forced)
                .iter()
                .any(|a| a.kind().is_move())
        });
        assert!(found_move);
    }

    #[test]
    fn test_system_partitions_untouched_by_default() {
        let sim = SimulatedCluster::builder()
            .nodes(5)
            .system_partitions(1, 5)
            .build();
        let snap = snapshot_of(&sim);
        let mut selector = FaultActionSelector::new(Some(2));
        for _ in 0..20 {
            assert!(
                selector
                    .select_next(&snap, 2, None, SelectionOptions::default())
                    .is_empty()
            );
        }
        let allowed = SelectionOptions {
            fault_system_services: true,
            ..SelectionOptions::default()
        };
        assert!(!selector.select_next(&snap, 2, None, allowed).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_selected_targets_are_disjoint(
            seed in any::<u64>(),
            nodes in 1usize..9,
            partitions in 0usize..8,
            replicas in 1usize..5,
            max in 1u32..6,
        ) {
            let sim = SimulatedCluster::builder()
                .nodes(nodes)
                .stateful_partitions(partitions, replicas.min(nodes))
                .build();
            let snap = sim.snapshot();
            let picked = FaultActionSelector::new(Some(seed))
                .select_next(&snap, max, None, SelectionOptions::default());

            prop_assert!(picked.len() <= max as usize);
            let mut seen = BTreeSet::new();
            for action in &picked {
                for target in action.targets(&snap) {
                    prop_assert!(seen.insert(target.clone()), "overlapping target {}", target);
                }
            }
        }
    }
}
