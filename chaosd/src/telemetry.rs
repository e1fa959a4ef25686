//! Telemetry markers for safety and lifecycle conditions.
//!
//! Each record is mirrored to `tracing::warn!` with a `telemetry_id` field so
//! log pipelines can aggregate by id. The in-memory copy is bounded by count
//! and age.

use chaos_common::TelemetryId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

const DEFAULT_MAX_RECORDS: usize = 1024;
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// A single telemetry marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    pub id: TelemetryId,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Shared, bounded store of telemetry markers.
#[derive(Clone)]
pub struct TelemetrySink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    max_records: usize,
    retention: ChronoDuration,
    records: RwLock<VecDeque<TelemetryRecord>>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS, DEFAULT_RETENTION)
    }
}

impl TelemetrySink {
    pub fn new(max_records: usize, retention: Duration) -> Self {
        let retention =
            ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            inner: Arc::new(SinkInner {
                max_records: max_records.max(1),
                retention,
                records: RwLock::new(VecDeque::new()),
            }),
        }
    }

    /// Record a marker and emit it as a warning.
    pub fn record(&self, id: TelemetryId, message: impl Into<String>) {
        let message = message.into();
        warn!(
            telemetry_id = %id,
            category = %id.category(),
            "{}",
            message
        );

        let mut records = self
            .inner
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner());
        records.push_back(TelemetryRecord {
            id,
            message,
            recorded_at: Utc::now(),
        });
        while records.len() > self.inner.max_records {
            records.pop_front();
        }
        let cutoff = Utc::now() - self.inner.retention;
        while records
            .front()
            .map(|r| r.recorded_at < cutoff)
            .unwrap_or(false)
        {
            records.pop_front();
        }
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.inner
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn count(&self, id: TelemetryId) -> usize {
        self.inner
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.id == id)
            .count()
    }

    pub fn contains(&self, id: TelemetryId) -> bool {
        self.count(id) > 0
    }
}
