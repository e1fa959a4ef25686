use chaos_common::{ChaosEvent, ChaosEventKind, ChaosParameters, EngineConfig, StopReason};
use chaosd::scheduler::{ChaosScheduler, SchedulerDeps};
use chaosd::sim::SimulatedCluster;
use chaosd::ClusterClients;
use std::sync::Arc;
use std::time::Duration;

pub fn init_test_logging() {
    chaos_common::testing::init_global_test_logging();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

/// Short waits so paused-clock runs finish in few virtual seconds.
pub fn quick_params() -> ChaosParameters {
    ChaosParameters {
        max_concurrent_faults: 1,
        wait_time_between_faults: Duration::from_secs(1),
        wait_time_between_iterations: Duration::from_secs(2),
        max_cluster_stabilization_timeout: Duration::from_secs(10),
        seed: Some(7),
        ..ChaosParameters::default()
    }
}

pub async fn open_scheduler(
    sim: &Arc<SimulatedCluster>,
    deps: impl FnOnce(SchedulerDeps) -> SchedulerDeps,
) -> ChaosScheduler {
    ChaosScheduler::open(
        EngineConfig::default(),
        deps(SchedulerDeps::new(ClusterClients::from_shared(sim.clone()))),
    )
    .await
    .expect("scheduler should open")
}

pub fn event_kinds(scheduler: &ChaosScheduler) -> Vec<ChaosEventKind> {
    scheduler
        .events()
        .records()
        .iter()
        .map(|r| r.event.kind())
        .collect()
}

pub fn stop_reasons(scheduler: &ChaosScheduler) -> Vec<StopReason> {
    scheduler
        .events()
        .records()
        .into_iter()
        .filter_map(|r| match r.event {
            ChaosEvent::Stopped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}
