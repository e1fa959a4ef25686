//! Environment variable parsing with range checks.
//!
//! Errors are collected rather than returned one at a time so a
//! misconfigured deployment sees every problem at once.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Environment parser for `CHAOS_*` variables.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::with_prefix("CHAOS_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" (case-insensitive).
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return default;
        };
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                default
            }
        }
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> u32 {
        self.get_range(name, default, min, max, "unsigned 32-bit integer")
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        self.get_range(name, default, min, max, "unsigned 64-bit integer")
    }

    pub fn get_f64_range(&mut self, name: &str, default: f64, min: f64, max: f64) -> f64 {
        self.get_range(name, default, min, max, "floating-point number")
    }

    /// Milliseconds, range-checked, returned as a `Duration`.
    pub fn get_millis_range(
        &mut self,
        name: &str,
        default: Duration,
        min: Duration,
        max: Duration,
    ) -> Duration {
        let ms = self.get_u64_range(
            name,
            default.as_millis() as u64,
            min.as_millis() as u64,
            max.as_millis() as u64,
        );
        Duration::from_millis(ms)
    }

    fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> T
    where
        T: std::str::FromStr + PartialOrd + ToString + Copy,
    {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return default;
        };
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => n,
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                default
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                });
                default
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["CHAOS_TEST_BOOL"];
        for val in ["1", "true", "YES", "on"] {
            set_env("CHAOS_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(parser.get_bool("TEST_BOOL", false), "expected true for '{val}'");
            assert!(!parser.has_errors());
        }
        for val in ["0", "false", "No", ""] {
            set_env("CHAOS_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(!parser.get_bool("TEST_BOOL", true), "expected false for '{val}'");
        }
        set_env("CHAOS_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(parser.get_bool("TEST_BOOL", true));
        assert!(parser.has_errors());
        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u32_range_out_of_range_uses_default() {
        let _guard = env_test_lock();
        let vars = ["CHAOS_TEST_U32_OOR"];
        set_env("CHAOS_TEST_U32_OOR", "500");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u32_range("TEST_U32_OOR", 3, 1, 100), 3);
        assert!(matches!(
            parser.errors()[0],
            EnvError::OutOfRange { ref var, .. } if var == "CHAOS_TEST_U32_OOR"
        ));
        cleanup_env(&vars);
    }

    #[test]
    fn test_get_f64_invalid() {
        let _guard = env_test_lock();
        let vars = ["CHAOS_TEST_F64"];
        set_env("CHAOS_TEST_F64", "abc");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_f64_range("TEST_F64", 0.2, 0.0, 1.0), 0.2);
        assert_eq!(parser.take_errors().len(), 1);
        assert!(!parser.has_errors());
        cleanup_env(&vars);
    }

    #[test]
    fn test_get_millis_range() {
        let _guard = env_test_lock();
        let vars = ["CHAOS_TEST_MS"];
        set_env("CHAOS_TEST_MS", "2500");
        let mut parser = EnvParser::new();
        let d = parser.get_millis_range(
            "TEST_MS",
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(d, Duration::from_millis(2500));
        cleanup_env(&vars);
    }

    #[test]
    fn test_unset_returns_default() {
        let _guard = env_test_lock();
        cleanup_env(&["CHAOS_TEST_UNSET"]);
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_UNSET", 9, 0, 10), 9);
        assert!(!parser.has_errors());
    }
}
