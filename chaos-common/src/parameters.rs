//! Run parameters for a chaos run.
//!
//! [`ChaosParameters`] is validated once at start and is immutable for the
//! duration of the run. Validation also decodes the internal context keys
//! into [`ContextFlags`].
//!
//! Individual parameters can be overridden by name (`--set Name=value`)
//! through a typed registry of setters, see [`ChaosParameters::apply_override`].

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

// ── Constants ───────────────────────────────────────────────────────────────

/// Prefix shared by every reserved context key.
pub const INTERNAL_KEY_PREFIX: &str = "ServiceFabric_Chaos_Internal_Context_Key_";

/// Forces every safety check to fail.
pub const KEY_FORCED_ASSERT: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_2B5321B6-4C8E-4B0F-9F4E-6E7D8C9A1B2D";
/// Allows replica moves even when move faults are disabled.
pub const KEY_FORCE_MOVE_REPLICA: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_Enable_Force_Move_Of_Replica";
/// Permits faulting system service partitions.
pub const KEY_FAULT_SYSTEM_SERVICES: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_Should_Fault_System_Services";
/// Overrides the snapshot retry budget.
pub const KEY_MAX_SNAPSHOT_RETRIES: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_MaxNumberOfRetriesInGetClusterSnapshotAction";
/// Continue/halt policy after a validation failure.
pub const KEY_FAILOVER_AFTER_FAULTS: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_FailoverAfterChaosFaults";
/// Skips target-filter input validation.
pub const KEY_DISABLE_FILTER_VALIDATION: &str =
    "ServiceFabric_Chaos_Internal_Context_Key_DisableInputValidationForChaosTargetFilter";

const INTERNAL_KEYS: &[&str] = &[
    KEY_FORCED_ASSERT,
    KEY_FORCE_MOVE_REPLICA,
    KEY_FAULT_SYSTEM_SERVICES,
    KEY_MAX_SNAPSHOT_RETRIES,
    KEY_FAILOVER_AFTER_FAULTS,
    KEY_DISABLE_FILTER_VALIDATION,
];

/// Maximum number of non-internal context entries.
pub const MAX_CONTEXT_ENTRIES: usize = 100;
/// Maximum length of a context key or value, in characters.
pub const MAX_CONTEXT_STRING_LENGTH: usize = 3072;
pub const MAX_NODE_TYPES_IN_FILTER: usize = 100;
pub const MAX_APPLICATIONS_IN_FILTER: usize = 1000;
pub const MAX_CONCURRENT_FAULTS_LIMIT: u32 = 1000;

pub const DEFAULT_MAX_CONCURRENT_FAULTS: u32 = 1;
pub const DEFAULT_WAIT_BETWEEN_ITERATIONS: Duration = Duration::from_secs(30);
pub const DEFAULT_WAIT_BETWEEN_FAULTS: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_CLUSTER_STABILIZATION: Duration = Duration::from_secs(60);
/// Upper bound for every duration parameter.
pub const MAX_DURATION_PARAMETER: Duration = Duration::from_secs(u32::MAX as u64);
pub const DEFAULT_TIME_TO_RUN: Duration = MAX_DURATION_PARAMETER;

// ── Health policy ───────────────────────────────────────────────────────────

/// Tolerance applied when judging cluster health after faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterHealthPolicy {
    pub consider_warning_as_error: bool,
    pub max_percent_unhealthy_nodes: u8,
    pub max_percent_unhealthy_applications: u8,
}

impl Default for ClusterHealthPolicy {
    fn default() -> Self {
        Self {
            consider_warning_as_error: true,
            max_percent_unhealthy_nodes: 0,
            max_percent_unhealthy_applications: 0,
        }
    }
}

// ── Target filter ───────────────────────────────────────────────────────────

/// Limits which cluster entities may be faulted.
///
/// Empty inclusion lists mean "everything". Exclusions always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosTargetFilter {
    pub include_node_types: Vec<String>,
    pub exclude_node_types: Vec<String>,
    pub include_applications: Vec<String>,
}

impl ChaosTargetFilter {
    pub fn is_empty(&self) -> bool {
        self.include_node_types.is_empty()
            && self.exclude_node_types.is_empty()
            && self.include_applications.is_empty()
    }

    pub fn allows_node_type(&self, node_type: &str) -> bool {
        if self.exclude_node_types.iter().any(|t| t == node_type) {
            return false;
        }
        self.include_node_types.is_empty() || self.include_node_types.iter().any(|t| t == node_type)
    }

    pub fn allows_application(&self, application: &str) -> bool {
        self.include_applications.is_empty()
            || self.include_applications.iter().any(|a| a == application)
    }

    /// Whole-node faults are only allowed when applications are not the sole
    /// scope of the filter.
    pub fn allows_node_faults(&self) -> bool {
        self.include_applications.is_empty() || !self.include_node_types.is_empty()
    }

    /// Checks that need no cluster access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.include_node_types.len() > MAX_NODE_TYPES_IN_FILTER
            || self.exclude_node_types.len() > MAX_NODE_TYPES_IN_FILTER
        {
            return Err(ConfigError::InvalidTargetFilter(format!(
                "at most {MAX_NODE_TYPES_IN_FILTER} node types per list"
            )));
        }
        if self.include_applications.len() > MAX_APPLICATIONS_IN_FILTER {
            return Err(ConfigError::InvalidTargetFilter(format!(
                "at most {MAX_APPLICATIONS_IN_FILTER} applications"
            )));
        }
        let all_names = self
            .include_node_types
            .iter()
            .chain(&self.exclude_node_types)
            .chain(&self.include_applications);
        if all_names.into_iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::InvalidTargetFilter(
                "names must not be empty".to_string(),
            ));
        }
        let included: BTreeSet<&str> = self.include_node_types.iter().map(String::as_str).collect();
        if let Some(both) = self
            .exclude_node_types
            .iter()
            .find(|t| included.contains(t.as_str()))
        {
            return Err(ConfigError::InvalidTargetFilter(format!(
                "node type '{both}' is both included and excluded"
            )));
        }
        Ok(())
    }
}

// ── Context flags ───────────────────────────────────────────────────────────

/// What to do after a validation failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Report and keep iterating.
    #[default]
    Continue,
    /// Stop the run.
    Halt,
}

/// Decoded internal context keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub forced_assert: bool,
    pub force_move_replica: bool,
    pub fault_system_services: bool,
    pub max_snapshot_retries: Option<u32>,
    pub failover_after_faults: FailoverPolicy,
    pub disable_target_filter_validation: bool,
}

// ── Parameters ──────────────────────────────────────────────────────────────

/// Configuration for a single chaos run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosParameters {
    #[serde(with = "duration_secs", rename = "max_cluster_stabilization_timeout_secs")]
    pub max_cluster_stabilization_timeout: Duration,
    pub max_concurrent_faults: u32,
    pub enable_move_replica_faults: bool,
    #[serde(with = "duration_secs", rename = "time_to_run_secs")]
    pub time_to_run: Duration,
    #[serde(with = "duration_secs", rename = "wait_time_between_iterations_secs")]
    pub wait_time_between_iterations: Duration,
    #[serde(with = "duration_secs", rename = "wait_time_between_faults_secs")]
    pub wait_time_between_faults: Duration,
    pub cluster_health_policy: ClusterHealthPolicy,
    pub target_filter: Option<ChaosTargetFilter>,
    pub context: BTreeMap<String, String>,
    /// Iteration budget; unlimited when unset.
    pub max_iterations: Option<u64>,
    /// Seed for fault selection; random when unset.
    pub seed: Option<u64>,
}

impl Default for ChaosParameters {
    fn default() -> Self {
        Self {
            max_cluster_stabilization_timeout: DEFAULT_MAX_CLUSTER_STABILIZATION,
            max_concurrent_faults: DEFAULT_MAX_CONCURRENT_FAULTS,
            enable_move_replica_faults: true,
            time_to_run: DEFAULT_TIME_TO_RUN,
            wait_time_between_iterations: DEFAULT_WAIT_BETWEEN_ITERATIONS,
            wait_time_between_faults: DEFAULT_WAIT_BETWEEN_FAULTS,
            cluster_health_policy: ClusterHealthPolicy::default(),
            target_filter: None,
            context: BTreeMap::new(),
            max_iterations: None,
            seed: None,
        }
    }
}

impl ChaosParameters {
    /// Validate and decode internal context flags.
    pub fn validate(&self) -> Result<ContextFlags, ConfigError> {
        if self.max_concurrent_faults == 0
            || self.max_concurrent_faults > MAX_CONCURRENT_FAULTS_LIMIT
        {
            return Err(ConfigError::OutOfRange {
                name: "MaxConcurrentFaults".to_string(),
                value: self.max_concurrent_faults.to_string(),
                min: "1".to_string(),
                max: MAX_CONCURRENT_FAULTS_LIMIT.to_string(),
            });
        }
        for (name, value, min) in [
            ("TimeToRunInSeconds", self.time_to_run, 1),
            (
                "WaitTimeBetweenIterationsInSeconds",
                self.wait_time_between_iterations,
                0,
            ),
            ("WaitTimeBetweenFaultsInSeconds", self.wait_time_between_faults, 0),
            (
                "MaxClusterStabilizationTimeoutInSeconds",
                self.max_cluster_stabilization_timeout,
                0,
            ),
        ] {
            if value.as_secs() < min || value > MAX_DURATION_PARAMETER {
                return Err(ConfigError::OutOfRange {
                    name: name.to_string(),
                    value: value.as_secs().to_string(),
                    min: min.to_string(),
                    max: MAX_DURATION_PARAMETER.as_secs().to_string(),
                });
            }
        }
        for (name, value) in [
            (
                "ClusterHealthPolicy.MaxPercentUnhealthyNodes",
                self.cluster_health_policy.max_percent_unhealthy_nodes,
            ),
            (
                "ClusterHealthPolicy.MaxPercentUnhealthyApplications",
                self.cluster_health_policy.max_percent_unhealthy_applications,
            ),
        ] {
            if value > 100 {
                return Err(ConfigError::OutOfRange {
                    name: name.to_string(),
                    value: value.to_string(),
                    min: "0".to_string(),
                    max: "100".to_string(),
                });
            }
        }

        let flags = self.context_flags()?;

        if let Some(filter) = &self.target_filter
            && !flags.disable_target_filter_validation
        {
            filter.validate()?;
        }

        Ok(flags)
    }

    /// Check context limits and decode the internal keys.
    pub fn context_flags(&self) -> Result<ContextFlags, ConfigError> {
        let user_entries = self
            .context
            .keys()
            .filter(|k| !k.starts_with(INTERNAL_KEY_PREFIX))
            .count();
        if user_entries > MAX_CONTEXT_ENTRIES {
            return Err(ConfigError::TooManyContextEntries {
                count: user_entries,
                max: MAX_CONTEXT_ENTRIES,
            });
        }

        let mut flags = ContextFlags::default();
        for (key, value) in &self.context {
            for (what, s) in [("key", key), ("value", value)] {
                let len = s.chars().count();
                if len > MAX_CONTEXT_STRING_LENGTH {
                    return Err(ConfigError::ContextEntryTooLong {
                        key: truncate_for_display(key),
                        what,
                        len,
                        max: MAX_CONTEXT_STRING_LENGTH,
                    });
                }
            }

            if !key.starts_with(INTERNAL_KEY_PREFIX) {
                continue;
            }
            match key.as_str() {
                KEY_FORCED_ASSERT => flags.forced_assert = parse_context_bool(key, value)?,
                KEY_FORCE_MOVE_REPLICA => {
                    flags.force_move_replica = parse_context_bool(key, value)?
                }
                KEY_FAULT_SYSTEM_SERVICES => {
                    flags.fault_system_services = parse_context_bool(key, value)?
                }
                KEY_DISABLE_FILTER_VALIDATION => {
                    flags.disable_target_filter_validation = parse_context_bool(key, value)?
                }
                KEY_FAILOVER_AFTER_FAULTS => {
                    flags.failover_after_faults = if parse_context_bool(key, value)? {
                        FailoverPolicy::Continue
                    } else {
                        FailoverPolicy::Halt
                    }
                }
                KEY_MAX_SNAPSHOT_RETRIES => {
                    let n = value.trim().parse::<u32>().map_err(|_| {
                        ConfigError::InvalidContextValue {
                            key: key.clone(),
                            value: value.clone(),
                            expected: "non-negative integer",
                        }
                    })?;
                    flags.max_snapshot_retries = Some(n);
                }
                _ => return Err(ConfigError::ReservedKey(key.clone())),
            }
        }
        Ok(flags)
    }

    /// Apply a single named override such as `ClusterHealthPolicy.ConsiderWarningAsError`.
    pub fn apply_override(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let setter = override_registry()
            .get(name)
            .ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))?;
        setter(self, value.trim())
    }

    /// Apply `Name=value` assignments in order.
    pub fn apply_assignments<'a>(
        &mut self,
        assignments: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        for assignment in assignments {
            let (name, value) = parse_assignment(assignment)?;
            self.apply_override(name, value)?;
        }
        Ok(())
    }

    /// Names accepted by [`apply_override`](Self::apply_override), sorted.
    pub fn override_names() -> Vec<&'static str> {
        let mut names: Vec<_> = override_registry().keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn truncate_for_display(s: &str) -> String {
    s.chars().take(64).collect()
}

fn parse_context_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value
        .trim()
        .parse::<bool>()
        .or_else(|_| value.trim().to_ascii_lowercase().parse::<bool>())
        .map_err(|_| ConfigError::InvalidContextValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: "true or false",
        })
}

/// Split `Name=value`.
pub fn parse_assignment(s: &str) -> Result<(&str, &str), ConfigError> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(ConfigError::Parse(format!(
            "expected Name=value, got '{s}'"
        ))),
    }
}

// ── Override registry ───────────────────────────────────────────────────────

type Setter = fn(&mut ChaosParameters, &str) -> Result<(), ConfigError>;

fn override_registry() -> &'static HashMap<&'static str, Setter> {
    static REGISTRY: OnceLock<HashMap<&'static str, Setter>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let entries: [(&'static str, Setter); 11] = [
            ("MaxConcurrentFaults", |p, v| {
                p.max_concurrent_faults =
                    parse_value("MaxConcurrentFaults", v, "unsigned integer")?;
                Ok(())
            }),
            ("TimeToRunInSeconds", |p, v| {
                p.time_to_run = secs("TimeToRunInSeconds", v)?;
                Ok(())
            }),
            ("WaitTimeBetweenIterationsInSeconds", |p, v| {
                p.wait_time_between_iterations = secs("WaitTimeBetweenIterationsInSeconds", v)?;
                Ok(())
            }),
            ("WaitTimeBetweenFaultsInSeconds", |p, v| {
                p.wait_time_between_faults = secs("WaitTimeBetweenFaultsInSeconds", v)?;
                Ok(())
            }),
            ("MaxClusterStabilizationTimeoutInSeconds", |p, v| {
                p.max_cluster_stabilization_timeout =
                    secs("MaxClusterStabilizationTimeoutInSeconds", v)?;
                Ok(())
            }),
            ("EnableMoveReplicaFaults", |p, v| {
                p.enable_move_replica_faults =
                    parse_value("EnableMoveReplicaFaults", v, "boolean")?;
                Ok(())
            }),
            ("ClusterHealthPolicy.ConsiderWarningAsError", |p, v| {
                p.cluster_health_policy.consider_warning_as_error =
                    parse_value("ClusterHealthPolicy.ConsiderWarningAsError", v, "boolean")?;
                Ok(())
            }),
            ("ClusterHealthPolicy.MaxPercentUnhealthyNodes", |p, v| {
                p.cluster_health_policy.max_percent_unhealthy_nodes = parse_value(
                    "ClusterHealthPolicy.MaxPercentUnhealthyNodes",
                    v,
                    "integer 0-100",
                )?;
                Ok(())
            }),
            ("ClusterHealthPolicy.MaxPercentUnhealthyApplications", |p, v| {
                p.cluster_health_policy.max_percent_unhealthy_applications = parse_value(
                    "ClusterHealthPolicy.MaxPercentUnhealthyApplications",
                    v,
                    "integer 0-100",
                )?;
                Ok(())
            }),
            ("MaxIterations", |p, v| {
                p.max_iterations = Some(parse_value("MaxIterations", v, "unsigned integer")?);
                Ok(())
            }),
            ("Seed", |p, v| {
                p.seed = Some(parse_value("Seed", v, "unsigned integer")?);
                Ok(())
            }),
        ];
        entries.into_iter().collect()
    })
}

fn parse_value<T: std::str::FromStr>(
    name: &str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidParameterValue {
            name: name.to_string(),
            value: value.to_string(),
            expected,
        })
}

fn secs(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(name, value, "whole seconds").map(Duration::from_secs)
}

/// Serialize a `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
