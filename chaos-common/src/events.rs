//! Lifecycle and progress events emitted by a chaos run.

use crate::compression::{compress, decompress, prepare_reason};
use crate::faults::FaultAction;
use crate::parameters::ChaosParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A caller asked the run to stop.
    UserInitiated,
    /// The run's time budget elapsed.
    TimeToRunElapsed,
    /// The run's iteration budget was used up.
    IterationBudgetReached,
    /// A validation failure under the halt policy.
    ValidationFailureHalt,
    /// A run-fatal error ended the run.
    RunFatal,
    /// A stale running state was found after a restart.
    SystemCannotRestart,
}

impl StopReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::UserInitiated => "Chaos was stopped by the user.",
            Self::TimeToRunElapsed => "Chaos has run for the full time-to-run.",
            Self::IterationBudgetReached => "Chaos has completed the configured iterations.",
            Self::ValidationFailureHalt => "Chaos was stopped after a validation failure.",
            Self::RunFatal => "Chaos was stopped by an unrecoverable error.",
            Self::SystemCannotRestart => "The system cannot restart Chaos.",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserInitiated => "user_initiated",
            Self::TimeToRunElapsed => "time_to_run_elapsed",
            Self::IterationBudgetReached => "iteration_budget_reached",
            Self::ValidationFailureHalt => "validation_failure_halt",
            Self::RunFatal => "run_fatal",
            Self::SystemCannotRestart => "system_cannot_restart",
        };
        write!(f, "{s}")
    }
}

/// Discriminant of [`ChaosEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosEventKind {
    Started,
    Stopped,
    ExecutingFaults,
    ValidationFailed,
    TestError,
    Waiting,
}

impl fmt::Display for ChaosEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::ExecutingFaults => "executing_faults",
            Self::ValidationFailed => "validation_failed",
            Self::TestError => "test_error",
            Self::Waiting => "waiting",
        };
        write!(f, "{s}")
    }
}

/// A chaos run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChaosEvent {
    Started {
        timestamp: DateTime<Utc>,
        parameters: Box<ChaosParameters>,
    },
    Stopped {
        timestamp: DateTime<Utc>,
        reason: StopReason,
    },
    ExecutingFaults {
        timestamp: DateTime<Utc>,
        faults: Vec<String>,
    },
    ValidationFailed {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    TestError {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    Waiting {
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

impl ChaosEvent {
    pub fn started(parameters: &ChaosParameters) -> Self {
        Self::Started {
            timestamp: Utc::now(),
            parameters: Box::new(parameters.clone()),
        }
    }

    pub fn stopped(reason: StopReason) -> Self {
        Self::Stopped {
            timestamp: Utc::now(),
            reason,
        }
    }

    pub fn executing_faults(faults: &[FaultAction]) -> Self {
        Self::ExecutingFaults {
            timestamp: Utc::now(),
            faults: faults.iter().map(ToString::to_string).collect(),
        }
    }

    /// Reason is capped and length-padded.
    pub fn validation_failed(reason: &str) -> Self {
        Self::ValidationFailed {
            timestamp: Utc::now(),
            reason: prepare_reason(reason),
        }
    }

    /// Reason is capped and length-padded.
    pub fn test_error(reason: &str) -> Self {
        Self::TestError {
            timestamp: Utc::now(),
            reason: prepare_reason(reason),
        }
    }

    /// Reason is capped and length-padded.
    pub fn waiting(reason: &str) -> Self {
        Self::Waiting {
            timestamp: Utc::now(),
            reason: prepare_reason(reason),
        }
    }

    pub fn kind(&self) -> ChaosEventKind {
        match self {
            Self::Started { .. } => ChaosEventKind::Started,
            Self::Stopped { .. } => ChaosEventKind::Stopped,
            Self::ExecutingFaults { .. } => ChaosEventKind::ExecutingFaults,
            Self::ValidationFailed { .. } => ChaosEventKind::ValidationFailed,
            Self::TestError { .. } => ChaosEventKind::TestError,
            Self::Waiting { .. } => ChaosEventKind::Waiting,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Started { timestamp, .. }
            | Self::Stopped { timestamp, .. }
            | Self::ExecutingFaults { timestamp, .. }
            | Self::ValidationFailed { timestamp, .. }
            | Self::TestError { timestamp, .. }
            | Self::Waiting { timestamp, .. } => *timestamp,
        }
    }

    /// Free-text reason, if the variant carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::ValidationFailed { reason, .. }
            | Self::TestError { reason, .. }
            | Self::Waiting { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// Copy with reason fields compressed for transport.
    pub fn to_wire(&self) -> Self {
        self.map_reason(compress)
    }

    /// Reverse [`to_wire`](Self::to_wire). Plain-text reasons pass through.
    pub fn from_wire(&self) -> Self {
        self.map_reason(decompress)
    }

    fn map_reason(&self, f: impl Fn(&str) -> String) -> Self {
        match self {
            Self::ValidationFailed { timestamp, reason } => Self::ValidationFailed {
                timestamp: *timestamp,
                reason: f(reason),
            },
            Self::TestError { timestamp, reason } => Self::TestError {
                timestamp: *timestamp,
                reason: f(reason),
            },
            Self::Waiting { timestamp, reason } => Self::Waiting {
                timestamp: *timestamp,
                reason: f(reason),
            },
            other => other.clone(),
        }
    }
}
