use crate::common::{init_test_logging, open_scheduler, quick_params};
use chaos_common::{ChaosParameters, ChaosStatus, ConfigError};
use chaosd::ChaosError;
use chaosd::sim::SimulatedCluster;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_oversized_context_rejected_before_cluster_contact() {
    init_test_logging();
    crate::test_log!("TEST START: test_oversized_context_rejected_before_cluster_contact");

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());
    let scheduler = open_scheduler(&sim, |d| d).await;
    let mut params = quick_params();
    for i in 0..101 {
        params.context.insert(format!("key{i}"), "value".to_string());
    }

    let err = scheduler.start(params).await.unwrap_err();
    assert!(matches!(
        err,
        ChaosError::Configuration(ConfigError::TooManyContextEntries { count: 101, max: 100 })
    ));
    assert_eq!(sim.interactions(), 0);
    assert_eq!(scheduler.status().status, ChaosStatus::Stopped);
    assert!(scheduler.events().is_empty());

    crate::test_log!("TEST PASS: test_oversized_context_rejected_before_cluster_contact");
}

#[tokio::test(start_paused = true)]
async fn test_zero_concurrent_faults_rejected() {
    init_test_logging();

    let sim = Arc::new(SimulatedCluster::builder().nodes(3).build());
    let scheduler = open_scheduler(&sim, |d| d).await;
    let params = ChaosParameters {
        max_concurrent_faults: 0,
        ..quick_params()
    };
    let err = scheduler.start(params).await.unwrap_err();
    assert!(matches!(
        err,
        ChaosError::Configuration(ConfigError::OutOfRange { .. })
    ));
    assert_eq!(sim.interactions(), 0);
}

#[test]
fn test_parameters_load_from_toml_with_overrides() {
    init_test_logging();

    let text = r#"
        max_concurrent_faults = 2
        time_to_run_secs = 600
        wait_time_between_faults_secs = 5

        [cluster_health_policy]
        max_percent_unhealthy_nodes = 10

        [context]
        owner = "nightly"
    "#;
    let mut params: ChaosParameters = toml::from_str(text).unwrap();
    assert_eq!(params.max_concurrent_faults, 2);
    assert_eq!(params.time_to_run, Duration::from_secs(600));
    assert_eq!(params.wait_time_between_faults, Duration::from_secs(5));
    assert_eq!(params.cluster_health_policy.max_percent_unhealthy_nodes, 10);
    assert!(params.cluster_health_policy.consider_warning_as_error);
    assert!(params.enable_move_replica_faults);

    params
        .apply_assignments([
            "ClusterHealthPolicy.MaxPercentUnhealthyNodes=25",
            "EnableMoveReplicaFaults=false",
        ])
        .unwrap();
    assert_eq!(params.cluster_health_policy.max_percent_unhealthy_nodes, 25);
    assert!(!params.enable_move_replica_faults);
    assert!(params.validate().is_ok());
}
