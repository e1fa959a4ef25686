//! Safety assertions.
//!
//! [`SafetyAssertion::check`] fires when the condition it is given is
//! **true**: callers pass the bad condition ("node is not up"), not the
//! invariant. With forced assert enabled every check fires.
//!
//! What happens when a check fires depends on [`EnforcementMode`]:
//!
//! - `Throw`: the violation is returned as `Err` for the caller to handle.
//! - `Assert`: the [`FatalHandler`] is invoked. The default handler logs the
//!   violation and a snapshot dump between fixed markers, then aborts.

use chaos_common::{ClusterStateSnapshot, SafetyViolation, TelemetryId};
use std::sync::Arc;
use tracing::{error, warn};

pub const ASSERT_PREAMBLE: &str = "======== CHAOS SAFETY ASSERTION BEGIN ========";
pub const ASSERT_POSTAMBLE: &str = "======== CHAOS SAFETY ASSERTION END ========";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Fail fast through the fatal handler.
    Assert,
    /// Return a recoverable error.
    #[default]
    Throw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyAssertionConfig {
    pub mode: EnforcementMode,
    /// Make every check fire regardless of its condition.
    pub forced_assert: bool,
}

impl SafetyAssertionConfig {
    pub fn new(engine_assert_enabled: bool, forced_assert: bool) -> Self {
        Self {
            mode: if engine_assert_enabled {
                EnforcementMode::Assert
            } else {
                EnforcementMode::Throw
            },
            forced_assert,
        }
    }
}

/// Invoked for violations in assert mode.
pub trait FatalHandler: Send + Sync {
    /// `dump` is the framed diagnostic text. Implementations may not return.
    fn on_fatal(&self, violation: &SafetyViolation, dump: &str);
}

/// Logs the dump and aborts the process.
pub struct ProcessAbort;

impl FatalHandler for ProcessAbort {
    fn on_fatal(&self, violation: &SafetyViolation, dump: &str) {
        error!(telemetry_id = %violation.id, "{}", dump);
        eprintln!("{dump}");
        std::process::abort();
    }
}

#[derive(Clone)]
pub struct SafetyAssertion {
    config: SafetyAssertionConfig,
    handler: Arc<dyn FatalHandler>,
}

impl SafetyAssertion {
    pub fn new(config: SafetyAssertionConfig) -> Self {
        Self::with_handler(config, Arc::new(ProcessAbort))
    }

    pub fn with_handler(config: SafetyAssertionConfig, handler: Arc<dyn FatalHandler>) -> Self {
        Self { config, handler }
    }

    pub fn config(&self) -> SafetyAssertionConfig {
        self.config
    }

    /// Fire if `condition` is true (or forced assert is on).
    pub fn check(
        &self,
        id: TelemetryId,
        condition: bool,
        message: impl FnOnce() -> String,
        snapshot: Option<&ClusterStateSnapshot>,
    ) -> Result<(), SafetyViolation> {
        if !condition && !self.config.forced_assert {
            return Ok(());
        }

        let mut violation = SafetyViolation::new(id, message());
        violation.forced = !condition;
        if let Some(snap) = snapshot {
            violation = violation.with_snapshot(snap.reference());
        }

        warn!(
            telemetry_id = %id,
            forced = violation.forced,
            mode = ?self.config.mode,
            "Safety check failed: {}",
            violation.message
        );

        if self.config.mode == EnforcementMode::Assert {
            let dump = format_dump(&violation, snapshot);
            self.handler.on_fatal(&violation, &dump);
        }
        Err(violation)
    }
}

/// Violation and snapshot framed between the assertion markers.
pub fn format_dump(violation: &SafetyViolation, snapshot: Option<&ClusterStateSnapshot>) -> String {
    let snapshot_text = snapshot
        .map(|s| {
            serde_json::to_string_pretty(s)
                .unwrap_or_else(|e| format!("<snapshot not serializable: {e}>"))
        })
        .unwrap_or_else(|| "<no snapshot>".to_string());
    format!(
        "{ASSERT_PREAMBLE}\nid: {}\nmessage: {}\nsnapshot:\n{}\n{ASSERT_POSTAMBLE}",
        violation.id, violation.message, snapshot_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        dumps: Mutex<Vec<String>>,
    }

    impl FatalHandler for Recording {
        fn on_fatal(&self, _violation: &SafetyViolation, dump: &str) {
            self.dumps.lock().unwrap().push(dump.to_string());
        }
    }

    fn snapshot() -> ClusterStateSnapshot {
        ClusterStateSnapshot::new(vec![], vec![], vec![])
    }

    #[test]
    fn test_throw_mode_false_condition_never_raises() {
        let safety = SafetyAssertion::new(SafetyAssertionConfig::default());
        for id in TelemetryId::all() {
            assert!(safety.check(*id, false, || unreachable!(), None).is_ok());
        }
    }

    #[test]
    fn test_true_condition_raises_with_snapshot_ref() {
        let safety = SafetyAssertion::new(SafetyAssertionConfig::default());
        let snap = snapshot();
        let v = safety
            .check(
                TelemetryId::FaultNodeNodeNotUp,
                true,
                || "node N1 is down".to_string(),
                Some(&snap),
            )
            .unwrap_err();
        assert_eq!(v.id, TelemetryId::FaultNodeNodeNotUp);
        assert_eq!(v.snapshot.map(|s| s.id), Some(snap.id));
        assert!(!v.forced);
    }

    #[test]
    fn test_forced_assert_fires_on_false_condition() {
        let safety = SafetyAssertion::new(SafetyAssertionConfig {
            forced_assert: true,
            ..SafetyAssertionConfig::default()
        });
        let v = safety
            .check(
                TelemetryId::PreAssertTargetTransitioning,
                false,
                || "forced".to_string(),
                None,
            )
            .unwrap_err();
        assert!(v.forced);
    }

    #[test]
    fn test_assert_mode_invokes_handler_with_framed_dump() {
        let handler = Arc::new(Recording::default());
        let safety = SafetyAssertion::with_handler(
            SafetyAssertionConfig::new(true, false),
            handler.clone(),
        );
        let snap = snapshot();
        let _ = safety.check(
            TelemetryId::ValidateClusterHealthRegressed,
            true,
            || "regressed".to_string(),
            Some(&snap),
        );

        let dumps = handler.dumps.lock().unwrap();
        assert_eq!(dumps.len(), 1);
        assert!(dumps[0].starts_with(ASSERT_PREAMBLE));
        assert!(dumps[0].ends_with(ASSERT_POSTAMBLE));
        assert!(dumps[0].contains("ValidateCluster_HealthRegressed"));
        assert!(dumps[0].contains(&snap.id.to_string()));
    }

    #[test]
    fn test_assert_mode_passing_check_skips_handler() {
        let handler = Arc::new(Recording::default());
        let safety =
            SafetyAssertion::with_handler(SafetyAssertionConfig::new(true, false), handler.clone());
        assert!(safety
            .check(TelemetryId::FaultNodeUnsafeNode, false, String::new, None)
            .is_ok());
        assert!(handler.dumps.lock().unwrap().is_empty());
    }
}
