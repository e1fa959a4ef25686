use crate::common::{event_kinds, init_test_logging, open_scheduler, quick_params, stop_reasons};
use chaos_common::{
    ChaosEvent, ChaosEventKind, ChaosParameters, ClusterHealthPolicy, FaultKind, StopReason,
    TelemetryId,
};
use chaosd::sim::SimulatedCluster;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

#[tokio::test(start_paused = true)]
async fn test_three_nodes_tolerant_policy_faults_once_then_waits() {
    init_test_logging();
    crate::test_log!("TEST START: test_three_nodes_tolerant_policy_faults_once_then_waits");

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).recovery(None).build());
    let scheduler = open_scheduler(&sim, |d| d).await;
    let params = ChaosParameters {
        max_iterations: Some(2),
        cluster_health_policy: ClusterHealthPolicy {
            max_percent_unhealthy_nodes: 50,
            ..ClusterHealthPolicy::default()
        },
        ..quick_params()
    };
    scheduler.start(params).await.unwrap();
    scheduler.wait_until_stopped().await;

    let executed = sim.executed_actions();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].kind(), FaultKind::RestartNode);
    assert_eq!(
        event_kinds(&scheduler),
        vec![
            ChaosEventKind::Started,
            ChaosEventKind::ExecutingFaults,
            ChaosEventKind::Waiting,
            ChaosEventKind::Stopped,
        ]
    );
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::IterationBudgetReached]);

    crate::test_log!("TEST PASS: test_three_nodes_tolerant_policy_faults_once_then_waits");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_retries_exhausted_stops_run() {
    init_test_logging();
    crate::test_log!("TEST START: test_snapshot_retries_exhausted_stops_run");

    let sim = Arc::new(SimulatedCluster::builder().nodes(5).build());
    sim.fail_next_queries(16);
    let scheduler = open_scheduler(&sim, |d| d).await;
    scheduler.start(quick_params()).await.unwrap();
    scheduler.wait_until_stopped().await;

    assert!(sim.executed_actions().is_empty());
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::RunFatal]);
    let records = scheduler.events().records();
    let error = records
        .iter()
        .find(|r| r.event.kind() == ChaosEventKind::TestError)
        .expect("run-fatal error event");
    assert!(
        error.event.reason().unwrap().contains("maximum number of retries"),
        "reason: {:?}",
        error.event.reason()
    );
    assert!(
        scheduler
            .telemetry()
            .contains(TelemetryId::GetClusterSnapshotMaximumRetriesAchieved)
    );

    crate::test_log!("TEST PASS: test_snapshot_retries_exhausted_stops_run");
}

#[tokio::test(start_paused = true)]
async fn test_transient_snapshot_failures_are_absorbed() {
    init_test_logging();

    let sim = Arc::new(SimulatedCluster::builder().nodes(5).build());
    sim.fail_next_queries(3);
    let scheduler = open_scheduler(&sim, |d| d).await;
    let params = ChaosParameters {
        max_iterations: Some(1),
        ..quick_params()
    };
    scheduler.start(params).await.unwrap();
    scheduler.wait_until_stopped().await;

    assert_eq!(sim.executed_actions().len(), 1);
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::IterationBudgetReached]);
}

#[tokio::test(start_paused = true)]
async fn test_executing_event_lists_selected_faults() {
    init_test_logging();

    let sim = Arc::new(SimulatedCluster::builder().nodes(5).build());
    let scheduler = open_scheduler(&sim, |d| d).await;
    let params = ChaosParameters {
        max_iterations: Some(3),
        max_concurrent_faults: 2,
        ..quick_params()
    };
    scheduler.start(params).await.unwrap();
    scheduler.wait_until_stopped().await;

    let listed: usize = scheduler
        .events()
        .records()
        .iter()
        .filter_map(|r| match &r.event {
            ChaosEvent::ExecutingFaults { faults, .. } => Some(faults.len()),
            _ => None,
        })
        .sum();
    // Two of five nodes may restart together without losing a majority.
    assert_eq!(listed, 6);
    assert_eq!(sim.executed_actions().len(), 6);
    assert_eq!(scheduler.status().iteration, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_fault_batch_awaits_in_flight_fault() {
    init_test_logging();
    crate::test_log!("TEST START: test_stop_during_fault_batch_awaits_in_flight_fault");

    let sim = Arc::new(
        SimulatedCluster::builder()
            .nodes(5)
            .action_delay(Duration::from_secs(20))
            .build(),
    );
    let scheduler = open_scheduler(&sim, |d| d).await;
    scheduler.start(quick_params()).await.unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(sim.issued_actions().len(), 1);
    assert!(sim.executed_actions().is_empty());

    let stop_requested = Instant::now();
    scheduler.stop().await.unwrap();
    assert!(stop_requested.elapsed() >= Duration::from_secs(14));
    assert_eq!(sim.executed_actions(), sim.issued_actions());

    sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.issued_actions().len(), 1);
    assert_eq!(
        event_kinds(&scheduler),
        vec![
            ChaosEventKind::Started,
            ChaosEventKind::ExecutingFaults,
            ChaosEventKind::Stopped,
        ]
    );
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::UserInitiated]);

    crate::test_log!("TEST PASS: test_stop_during_fault_batch_awaits_in_flight_fault");
}
