use crate::common::{event_kinds, init_test_logging, open_scheduler, quick_params, stop_reasons};
use chaos_common::{
    ChaosEventKind, ChaosParameters, ChaosStatus, EngineConfig, RunState, StopReason, TelemetryId,
};
use chaosd::scheduler::{ChaosScheduler, SchedulerDeps};
use chaosd::sim::SimulatedCluster;
use chaosd::state_store::{FileStateStore, MemoryStateStore, StateStore};
use chaosd::{ClusterClients, EventStream};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn orphaned_state() -> RunState {
    RunState {
        run_id: "nightly".to_string(),
        status: ChaosStatus::Running,
        iteration: 4,
        controller_id: Some(Uuid::new_v4()),
        parameters: Some(ChaosParameters::default()),
        ..RunState::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_then_stop_writes_one_stopped_event() {
    init_test_logging();
    crate::test_log!("TEST START: test_start_then_stop_writes_one_stopped_event");

    let sim = Arc::new(SimulatedCluster::builder().nodes(5).stateful_partitions(2, 3).build());
    let scheduler = open_scheduler(&sim, |d| d).await;

    scheduler.start(quick_params()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    scheduler.stop().await.unwrap();
    // A second stop finds nothing to do.
    scheduler.stop().await.unwrap();

    let kinds = event_kinds(&scheduler);
    assert_eq!(kinds.first(), Some(&ChaosEventKind::Started));
    assert_eq!(kinds.last(), Some(&ChaosEventKind::Stopped));
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::UserInitiated]);
    assert_eq!(scheduler.status().status, ChaosStatus::Stopped);
    assert!(scheduler.status().iteration >= 1);

    crate::test_log!("TEST PASS: test_start_then_stop_writes_one_stopped_event");
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_run_is_reset_on_open() {
    init_test_logging();
    crate::test_log!("TEST START: test_orphaned_run_is_reset_on_open");

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());
    let store = Arc::new(MemoryStateStore::with_state(orphaned_state()));
    let scheduler = open_scheduler(&sim, |d| d.with_store(store.clone())).await;

    assert_eq!(scheduler.status().status, ChaosStatus::Stopped);
    assert_eq!(scheduler.status().controller_id, None);
    assert_eq!(
        event_kinds(&scheduler),
        vec![ChaosEventKind::TestError, ChaosEventKind::Stopped]
    );
    assert_eq!(stop_reasons(&scheduler), vec![StopReason::SystemCannotRestart]);
    assert!(
        scheduler
            .telemetry()
            .contains(TelemetryId::ChaosSchedulerStateResetOnRestart)
    );
    assert_eq!(store.current().unwrap().status, ChaosStatus::Stopped);
    assert_eq!(sim.interactions(), 0);

    // The reset scheduler can start a fresh run.
    scheduler.start(quick_params()).await.unwrap();
    scheduler.stop().await.unwrap();
    assert_eq!(
        stop_reasons(&scheduler),
        vec![StopReason::SystemCannotRestart, StopReason::UserInitiated]
    );

    crate::test_log!("TEST PASS: test_orphaned_run_is_reset_on_open");
}

#[tokio::test(start_paused = true)]
async fn test_orphan_reset_skips_events_when_already_stopped() {
    init_test_logging();

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());
    let events = EventStream::new(100);
    events.append(chaos_common::ChaosEvent::stopped(StopReason::UserInitiated));
    let store = Arc::new(MemoryStateStore::with_state(orphaned_state()));
    let scheduler =
        open_scheduler(&sim, |d| d.with_store(store.clone()).with_events(events.clone())).await;

    assert_eq!(events.len(), 1);
    assert_eq!(scheduler.status().status, ChaosStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_file_store_survives_scheduler_restart() {
    init_test_logging();
    crate::test_log!("TEST START: test_file_store_survives_scheduler_restart");

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("chaos-state.json");
    let events_path = dir.path().join("events.jsonl");
    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());

    let first = ChaosScheduler::open(
        EngineConfig::default(),
        SchedulerDeps::new(ClusterClients::from_shared(sim.clone()))
            .with_store(Arc::new(FileStateStore::new(&state_path)))
            .with_events(EventStream::with_persistence(100, events_path.clone()).unwrap()),
    )
    .await
    .unwrap();
    let params = ChaosParameters {
        max_iterations: Some(1),
        ..quick_params()
    };
    first.start_with_run_id("weekly", params).await.unwrap();
    first.wait_until_stopped().await;
    let persisted_events = first.events().len();

    let store = FileStateStore::new(&state_path);
    let saved = store.load().await.unwrap().unwrap();
    assert_eq!(saved.run_id, "weekly");
    assert_eq!(saved.status, ChaosStatus::Stopped);
    assert_eq!(saved.iteration, 1);

    let second = ChaosScheduler::open(
        EngineConfig::default(),
        SchedulerDeps::new(ClusterClients::from_shared(sim.clone()))
            .with_store(Arc::new(store))
            .with_events(EventStream::with_persistence(100, events_path).unwrap()),
    )
    .await
    .unwrap();
    assert_eq!(second.status().run_id, "weekly");
    assert_eq!(second.events().len(), persisted_events);
    assert_eq!(stop_reasons(&second), vec![StopReason::IterationBudgetReached]);
    assert!(!second.telemetry().contains(TelemetryId::ChaosSchedulerStateResetOnRestart));

    crate::test_log!("TEST PASS: test_file_store_survives_scheduler_restart");
}

#[tokio::test(start_paused = true)]
async fn test_status_watch_follows_run() {
    init_test_logging();

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());
    let scheduler = open_scheduler(&sim, |d| d).await;
    let mut status = scheduler.watch_status();

    scheduler.start(quick_params()).await.unwrap();
    assert_eq!(status.borrow_and_update().status, ChaosStatus::Running);

    scheduler.stop().await.unwrap();
    status.changed().await.ok();
    assert_eq!(status.borrow().status, ChaosStatus::Stopped);
}
