//! Persisted scheduler state.

use crate::parameters::ChaosParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Run id used when the caller supplies none.
pub const DEFAULT_RUN_ID: &str = "adhoc";

/// Scheduler run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ChaosStatus {
    /// Any status other than `Stopped`.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ChaosStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Durable state of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: ChaosStatus,
    pub iteration: u64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::parameters::duration_secs")]
    pub elapsed: Duration,
    #[serde(with = "crate::parameters::duration_secs")]
    pub time_to_run: Duration,
    /// Scheduler instance that owns the run while it is active.
    pub controller_id: Option<Uuid>,
    pub last_updated: DateTime<Utc>,
    pub parameters: Option<ChaosParameters>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run_id: DEFAULT_RUN_ID.to_string(),
            status: ChaosStatus::Stopped,
            iteration: 0,
            started_at: None,
            elapsed: Duration::ZERO,
            time_to_run: Duration::ZERO,
            controller_id: None,
            last_updated: Utc::now(),
            parameters: None,
        }
    }
}

impl RunState {
    /// Time budget left.
    pub fn remaining(&self) -> Duration {
        self.time_to_run.saturating_sub(self.elapsed)
    }

    /// Whether this state claims an active run not owned by `controller`.
    pub fn is_orphaned(&self, controller: Uuid) -> bool {
        self.status.is_active() && self.controller_id != Some(controller)
    }

    /// Move to `status`, stamping `last_updated`.
    pub fn transition(&mut self, status: ChaosStatus) {
        self.status = status;
        self.last_updated = Utc::now();
    }
}
