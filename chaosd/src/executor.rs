//! One chaos iteration.
//!
//! ```text
//! Idle -> Snapshotting -> Selecting -> PreAsserting -> Executing
//!      -> Stabilizing -> PostAsserting -> Emitting -> Idle
//! ```
//!
//! Any phase may end in `Failed`. Iteration-level failures become events and
//! an [`IterationOutcome`]; only run-fatal errors are returned as `Err`.

use crate::cluster::ClusterClients;
use crate::error::ChaosError;
use crate::events::EventStream;
use crate::health::HealthReporter;
use crate::retry::{RetryError, RetryPolicy};
use crate::safety::SafetyAssertion;
use crate::selector::{FaultActionSelector, SelectionOptions};
use crate::snapshot::SnapshotCapturer;
use crate::telemetry::TelemetrySink;
use chaos_common::{
    ChaosEvent, ChaosParameters, ClusterError, ClusterStateSnapshot, ContextFlags, EngineConfig,
    EntityRef, FaultAction, PartitionId, SafetyViolation, TelemetryId,
};
use futures::future::join_all;
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EXECUTE_FAULT_OPERATION: &str = "ExecuteFault";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    Idle,
    Snapshotting,
    Selecting,
    PreAsserting,
    Executing,
    Stabilizing,
    PostAsserting,
    Emitting,
    Failed,
}

impl fmt::Display for IterationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Snapshotting => "snapshotting",
            Self::Selecting => "selecting",
            Self::PreAsserting => "pre_asserting",
            Self::Executing => "executing",
            Self::Stabilizing => "stabilizing",
            Self::PostAsserting => "post_asserting",
            Self::Emitting => "emitting",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Faults ran and the cluster validated.
    Completed { faults: Vec<FaultAction> },
    /// Nothing safe to fault; a Waiting event was emitted.
    Waiting,
    /// A safety check failed; a ValidationFailed event was emitted.
    ValidationFailed,
    /// A non-retriable error; a TestError event was emitted.
    Failed,
    /// Cancelled before completion. In-flight faults were awaited.
    Cancelled,
}

pub struct IterationExecutor {
    params: ChaosParameters,
    flags: ContextFlags,
    config: EngineConfig,
    clients: ClusterClients,
    capturer: SnapshotCapturer,
    retry: RetryPolicy,
    safety: SafetyAssertion,
    selector: FaultActionSelector,
    events: EventStream,
    health: HealthReporter,
    telemetry: TelemetrySink,
    phase: IterationPhase,
}

impl IterationExecutor {
    pub fn new(
        params: ChaosParameters,
        flags: ContextFlags,
        config: EngineConfig,
        clients: ClusterClients,
        events: EventStream,
        telemetry: TelemetrySink,
        safety: SafetyAssertion,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        let capturer = SnapshotCapturer::new(
            clients.query.clone(),
            retry.clone(),
            flags
                .max_snapshot_retries
                .unwrap_or(config.max_snapshot_retries),
            config.snapshot_operation_timeout,
            telemetry.clone(),
        );
        Self {
            selector: FaultActionSelector::new(params.seed),
            health: HealthReporter::new(clients.health.clone()),
            params,
            flags,
            config,
            clients,
            capturer,
            retry,
            safety,
            events,
            telemetry,
            phase: IterationPhase::Idle,
        }
    }

    pub fn phase(&self) -> IterationPhase {
        self.phase
    }

    fn enter(&mut self, phase: IterationPhase) {
        debug!(from = %self.phase, to = %phase, "Iteration phase");
        self.phase = phase;
    }

    fn selection_options(&self) -> SelectionOptions {
        SelectionOptions {
            enable_move_replica_faults: self.params.enable_move_replica_faults,
            force_move_replica: self.flags.force_move_replica,
            fault_system_services: self.flags.fault_system_services,
        }
    }

    /// Run one iteration.
    ///
    /// Returns `Err` only for run-fatal errors (which have not been turned
    /// into events; the scheduler reports them).
    pub async fn run_iteration(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, ChaosError> {
        let outcome = self.run_phases(cancel).await;
        if !matches!(outcome, Ok(IterationOutcome::Failed) | Err(_)) {
            self.enter(IterationPhase::Idle);
        }
        outcome
    }

    async fn run_phases(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, ChaosError> {
        self.enter(IterationPhase::Snapshotting);
        let pre = match self.capture(cancel).await? {
            Captured::Snapshot(s) => s,
            Captured::Outcome(o) => return Ok(o),
        };

        let mut current = pre.clone();
        let mut selected = None;
        for attempt in 1..=self.config.max_selection_attempts {
            self.enter(IterationPhase::Selecting);
            let faults = self.selector.select_next(
                &current,
                self.params.max_concurrent_faults,
                self.params.target_filter.as_ref(),
                self.selection_options(),
            );
            if faults.is_empty() {
                return Ok(self.wait("No eligible fault targets in the cluster."));
            }

            self.enter(IterationPhase::PreAsserting);
            let check = match self.capture(cancel).await? {
                Captured::Snapshot(s) => s,
                Captured::Outcome(o) => return Ok(o),
            };
            match pre_assert(&self.safety, &faults, &check) {
                Ok(()) => {
                    selected = Some(faults);
                    break;
                }
                Err(v) if v.is_run_fatal() => return Err(v.into()),
                Err(v) if v.forced => return Ok(self.validation_failed(&v).await),
                Err(v) => {
                    debug!(
                        attempt,
                        telemetry_id = %v.id,
                        "Discarding fault selection: {}",
                        v.message
                    );
                    current = check;
                }
            }
        }
        let Some(faults) = selected else {
            return Ok(self.wait(&format!(
                "Fault selection discarded {} times because targets were unsafe or transitioning.",
                self.config.max_selection_attempts
            )));
        };

        self.enter(IterationPhase::Executing);
        self.events.append(ChaosEvent::executing_faults(&faults));
        info!(count = faults.len(), "Executing fault batch");
        let failures = self.execute_batch(&faults, cancel).await;
        if cancel.is_cancelled() {
            return Ok(IterationOutcome::Cancelled);
        }
        if !failures.is_empty() {
            let reason = failures.join("; ");
            return Ok(self.fail(&reason).await);
        }

        self.enter(IterationPhase::Stabilizing);
        if !self
            .sleep_cancellable(self.params.wait_time_between_faults, cancel)
            .await
        {
            return Ok(IterationOutcome::Cancelled);
        }
        let post = match self.stabilize(cancel).await? {
            Captured::Snapshot(s) => s,
            Captured::Outcome(o) => return Ok(o),
        };

        self.enter(IterationPhase::PostAsserting);
        let evaluation = post.evaluate_health(&self.params.cluster_health_policy);
        let check = self.safety.check(
            TelemetryId::ValidateClusterHealthRegressed,
            !evaluation.is_healthy(),
            || {
                format!(
                    "Cluster health is {} after faults ({} unhealthy entities: {}). Changes: {}",
                    evaluation.state,
                    evaluation.unhealthy.len(),
                    describe_entities(&evaluation.unhealthy),
                    pre.diff(&post).summary()
                )
            },
            Some(&post),
        );
        if let Err(v) = check {
            if v.is_run_fatal() {
                return Err(v.into());
            }
            return Ok(self.validation_failed(&v).await);
        }

        self.enter(IterationPhase::Emitting);
        self.health
            .report_ok("Chaos validation passed after fault batch.")
            .await;
        Ok(IterationOutcome::Completed { faults })
    }

    /// Run every fault concurrently and wait for all of them.
    async fn execute_batch(
        &self,
        faults: &[FaultAction],
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let results = join_all(faults.iter().map(|f| self.execute_fault(f, cancel))).await;
        let mut failures = Vec::new();
        for (fault, result) in faults.iter().zip(results) {
            match result {
                Ok(()) => debug!(fault = %fault, "Fault action completed"),
                Err(RetryError::Cancelled { .. }) => {
                    debug!(fault = %fault, "Fault action not issued: cancelled")
                }
                Err(e) => {
                    let message = format!("{fault}: {e}");
                    self.telemetry
                        .record(TelemetryId::ExecuteFaultActionFailed, message.clone());
                    failures.push(message);
                }
            }
        }
        failures
    }

    async fn execute_fault(
        &self,
        action: &FaultAction,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError> {
        let client = self.clients.faults.clone();
        self.retry
            .execute_awaited(
                EXECUTE_FAULT_OPERATION,
                |request_timeout| {
                    let client = client.clone();
                    let token = cancel.clone();
                    async move { client.execute(action, request_timeout, token).await }
                },
                ClusterError::is_retryable,
                self.config.fault_action_retries,
                self.config.fault_action_timeout,
                cancel,
            )
            .await
    }

    /// Poll until the cluster satisfies the health policy or the
    /// stabilization timeout elapses. Returns the last snapshot.
    async fn stabilize(&mut self, cancel: &CancellationToken) -> Result<Captured, ChaosError> {
        let deadline = Instant::now()
            .checked_add(self.params.max_cluster_stabilization_timeout)
            .unwrap_or_else(far_future);
        loop {
            let snapshot = match self.capture(cancel).await? {
                Captured::Snapshot(s) => s,
                outcome => return Ok(outcome),
            };
            let evaluation = snapshot.evaluate_health(&self.params.cluster_health_policy);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if evaluation.is_healthy() || remaining.is_zero() {
                debug!(
                    state = %evaluation.state,
                    unhealthy = evaluation.unhealthy.len(),
                    "Stabilization finished"
                );
                return Ok(Captured::Snapshot(snapshot));
            }
            let poll = self.config.stabilization_poll.min(remaining);
            if !self.sleep_cancellable(poll, cancel).await {
                return Ok(Captured::Outcome(IterationOutcome::Cancelled));
            }
        }
    }

    async fn capture(&mut self, cancel: &CancellationToken) -> Result<Captured, ChaosError> {
        match self.capturer.capture(cancel).await {
            Ok(snapshot) => Ok(Captured::Snapshot(snapshot)),
            Err(ChaosError::Cancelled) => Ok(Captured::Outcome(IterationOutcome::Cancelled)),
            Err(e) if e.is_run_fatal() => {
                self.enter(IterationPhase::Failed);
                Err(e)
            }
            Err(e) => {
                if let Some(id) = e.telemetry_id() {
                    self.telemetry.record(id, e.to_string());
                }
                Ok(Captured::Outcome(self.fail(&e.to_string()).await))
            }
        }
    }

    async fn sleep_cancellable(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn wait(&mut self, reason: &str) -> IterationOutcome {
        info!("Chaos waiting: {}", reason);
        self.events.append(ChaosEvent::waiting(reason));
        IterationOutcome::Waiting
    }

    async fn validation_failed(&mut self, violation: &SafetyViolation) -> IterationOutcome {
        warn!(telemetry_id = %violation.id, forced = violation.forced, "Validation failed");
        self.enter(IterationPhase::Emitting);
        let reason = violation.to_string();
        self.events.append(ChaosEvent::validation_failed(&reason));
        self.health.report_failure(&reason).await;
        IterationOutcome::ValidationFailed
    }

    async fn fail(&mut self, reason: &str) -> IterationOutcome {
        warn!(phase = %self.phase, "Iteration failed: {}", reason);
        self.enter(IterationPhase::Failed);
        self.events.append(ChaosEvent::test_error(reason));
        self.health.report_failure(reason).await;
        IterationOutcome::Failed
    }
}

/// About thirty years out, for deadlines too large to represent.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

enum Captured {
    Snapshot(ClusterStateSnapshot),
    Outcome(IterationOutcome),
}

fn describe_entities(entities: &[EntityRef]) -> String {
    if entities.is_empty() {
        return "none".to_string();
    }
    entities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check a selected batch against a fresh snapshot.
///
/// Every check passes the unsafe condition, so a violation means the batch
/// must not run as selected.
pub fn pre_assert(
    safety: &SafetyAssertion,
    faults: &[FaultAction],
    snapshot: &ClusterStateSnapshot,
) -> Result<(), SafetyViolation> {
    let snap = Some(snapshot);
    for fault in faults {
        for target in fault.targets(snapshot) {
            safety.check(
                TelemetryId::PreAssertTargetTransitioning,
                snapshot.is_transitioning(&target),
                || format!("{target} targeted by {fault} is transitioning"),
                snap,
            )?;
        }

        let partition_not_tolerant = |pid: &PartitionId| {
            snapshot
                .partition(pid)
                .is_none_or(|p| !p.is_fault_tolerant())
        };
        match fault {
            FaultAction::RestartNode { node } => {
                safety.check(
                    TelemetryId::FaultNodeNodeNotUp,
                    snapshot.node(node).is_none_or(|n| !n.is_up()),
                    || format!("node {node} is not up"),
                    snap,
                )?;
                let remaining_up = snapshot.up_nodes().count().saturating_sub(1);
                let breaks_partition = snapshot.partitions_on_node(node).any(|p| {
                    p.replica_on(node).is_some_and(|r| r.is_ready()) && !p.is_fault_tolerant()
                });
                safety.check(
                    TelemetryId::FaultNodeUnsafeNode,
                    remaining_up < snapshot.node_majority() || breaks_partition,
                    || {
                        format!(
                            "restarting {node} leaves {remaining_up} up nodes (majority {}) or breaks partition quorum",
                            snapshot.node_majority()
                        )
                    },
                    snap,
                )?;
            }
            FaultAction::RestartCodePackage { node, application } => {
                let unsafe_package = snapshot
                    .application_partitions_on_node(node, application)
                    .any(|p| {
                        p.replica_on(node).is_some_and(|r| r.is_ready()) && !p.is_fault_tolerant()
                    });
                safety.check(
                    TelemetryId::RestartCodePackageUnsafeCodePackage,
                    unsafe_package,
                    || {
                        format!(
                            "code package {application} on {node} hosts a non-fault-tolerant partition"
                        )
                    },
                    snap,
                )?;
            }
            FaultAction::RestartReplica { partition, .. } => {
                safety.check(
                    TelemetryId::RestartReplicaPartitionNotFaultTolerant,
                    partition_not_tolerant(partition),
                    || format!("partition {partition} is not fault tolerant"),
                    snap,
                )?;
            }
            FaultAction::RemoveReplica { partition, .. } => {
                safety.check(
                    TelemetryId::RemoveReplicaPartitionNotFaultTolerant,
                    partition_not_tolerant(partition),
                    || format!("partition {partition} is not fault tolerant"),
                    snap,
                )?;
            }
            FaultAction::MovePrimary { partition, to, .. }
            | FaultAction::MoveSecondary { partition, to, .. } => {
                safety.check(
                    TelemetryId::MoveReplicaPartitionNotFaultTolerant,
                    partition_not_tolerant(partition),
                    || format!("partition {partition} is not fault tolerant"),
                    snap,
                )?;
                let bad_destination = snapshot.node(to).is_none_or(|n| !n.is_up())
                    || snapshot
                        .partition(partition)
                        .is_some_and(|p| p.replica_on(to).is_some());
                safety.check(
                    TelemetryId::MoveReplicaNoDestinationNode,
                    bad_destination,
                    || format!("node {to} cannot receive a replica of {partition}"),
                    snap,
                )?;
            }
        }
    }
    Ok(())
}
