//! Health reports about chaos validation results.
//!
//! Reporting is best effort: failures are logged and never fail an
//! iteration.

use crate::cluster::{HealthClient, HealthReport};
use chaos_common::HealthState;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub const HEALTH_SOURCE_ID: &str = "System.FaultAnalysisService";
pub const HEALTH_PROPERTY: &str = "ChaosValidation";

const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HealthReporter {
    client: Arc<dyn HealthClient>,
    timeout: Duration,
    sequence: Arc<AtomicI64>,
}

impl HealthReporter {
    pub fn new(client: Arc<dyn HealthClient>) -> Self {
        Self {
            client,
            timeout: DEFAULT_REPORT_TIMEOUT,
            sequence: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis())),
        }
    }

    /// Warning report after a validation failure or test error.
    pub async fn report_failure(&self, description: &str) {
        self.report(HealthState::Warning, description).await;
    }

    /// Ok report after a successful validation.
    pub async fn report_ok(&self, description: &str) {
        self.report(HealthState::Ok, description).await;
    }

    async fn report(&self, state: HealthState, description: &str) {
        let report = HealthReport {
            source_id: HEALTH_SOURCE_ID.to_string(),
            property: HEALTH_PROPERTY.to_string(),
            state,
            description: description.to_string(),
            entity: None,
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst),
            time_to_live: None,
        };

        match tokio::time::timeout(self.timeout, self.client.report_health(report)).await {
            Ok(Ok(())) => debug!(state = %state, "Submitted chaos health report"),
            Ok(Err(e)) => warn!(state = %state, error = %e, "Failed to submit health report"),
            Err(_) => warn!(state = %state, "Health report timed out"),
        }
    }
}
