//! Cluster snapshot capture.

use crate::cluster::ClusterQueryClient;
use crate::error::ChaosError;
use crate::retry::{RetryError, RetryPolicy};
use crate::telemetry::TelemetrySink;
use chaos_common::{ClusterError, ClusterStateSnapshot, TelemetryId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const OPERATION: &str = "GetClusterSnapshot";

/// Delay between snapshot attempts.
pub const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Captures [`ClusterStateSnapshot`]s with retries.
#[derive(Clone)]
pub struct SnapshotCapturer {
    query: Arc<dyn ClusterQueryClient>,
    retry: RetryPolicy,
    max_retries: u32,
    operation_timeout: Duration,
    telemetry: TelemetrySink,
}

impl SnapshotCapturer {
    pub fn new(
        query: Arc<dyn ClusterQueryClient>,
        retry: RetryPolicy,
        max_retries: u32,
        operation_timeout: Duration,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            query,
            retry: retry.with_fixed_delay(SNAPSHOT_RETRY_DELAY),
            max_retries,
            operation_timeout,
            telemetry,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Capture nodes, partitions and in-flight markers as one snapshot.
    ///
    /// Any failed query retries the whole capture. Running out of retries
    /// yields [`ChaosError::MaxRetriesAchieved`]; running out of time yields
    /// [`ChaosError::Timeout`].
    pub async fn capture(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ClusterStateSnapshot, ChaosError> {
        let result = self
            .retry
            .execute(
                OPERATION,
                |request_timeout| {
                    let query = self.query.clone();
                    async move {
                        let nodes = query.get_node_list(request_timeout).await?;
                        let partitions = query.get_partition_list(request_timeout).await?;
                        let in_flight = query.get_in_flight_markers(request_timeout).await?;
                        Ok::<_, ClusterError>(ClusterStateSnapshot::new(
                            nodes, partitions, in_flight,
                        ))
                    }
                },
                ClusterError::is_retryable,
                self.max_retries,
                self.operation_timeout,
                cancel,
            )
            .await;

        match result {
            Ok(snapshot) => {
                debug!(
                    snapshot_id = %snapshot.id,
                    nodes = snapshot.nodes.len(),
                    partitions = snapshot.partitions.len(),
                    "Captured cluster snapshot"
                );
                Ok(snapshot)
            }
            Err(RetryError::Exhausted {
                operation,
                attempts,
                last,
            }) => {
                let id = TelemetryId::GetClusterSnapshotMaximumRetriesAchieved;
                self.telemetry.record(
                    id,
                    format!("{operation} failed {attempts} consecutive times: {last}"),
                );
                Err(ChaosError::MaxRetriesAchieved {
                    operation,
                    attempts,
                    last,
                })
            }
            Err(e) => {
                warn!(error = %e, "Cluster snapshot capture failed");
                Err(e.into())
            }
        }
    }
}
