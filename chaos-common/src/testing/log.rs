//! JSONL capture of tracing output for test runs.
//!
//! [`init_global_test_logging`] installs a global subscriber once per test
//! binary. Engine spans (`chaos_run`, `iteration`) and `test`-target markers
//! land in one JSON-lines file so a failed scenario can be replayed event by
//! event; a compact copy goes to the test writer.

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

const LOG_FILE_ENV: &str = "CHAOS_TEST_LOG_FILE";
const LOG_LEVEL_ENV: &str = "CHAOS_TEST_LOG_LEVEL";
const DEFAULT_LOG_NAME: &str = "chaos_tests.jsonl";

static INIT: Once = Once::new();

/// Install the test subscriber. Later calls do nothing.
///
/// `CHAOS_TEST_LOG_FILE` overrides the output path and
/// `CHAOS_TEST_LOG_LEVEL` the level (default `info`).
pub fn init_global_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "chaosd={level},chaos_common={level},test=info"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let json_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_span_list(false)
        });

        let console_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(console_layer)
            .try_init();
    });
}

/// Where [`init_global_test_logging`] writes its JSONL output.
pub fn test_log_path() -> PathBuf {
    match std::env::var(LOG_FILE_ENV) {
        Ok(path) => PathBuf::from(path),
        Err(_) => target_dir().join("test-logs").join(DEFAULT_LOG_NAME),
    }
}

fn open_log_file() -> Option<std::fs::File> {
    let path = test_log_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    std::fs::File::create(path).ok()
}

/// `CARGO_TARGET_DIR`, else the nearest `target` above the working directory.
fn target_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(dir);
    }
    let mut dir = std::env::current_dir().unwrap_or_default();
    loop {
        let candidate = dir.join("target");
        if candidate.is_dir() {
            return candidate;
        }
        if !dir.pop() {
            return PathBuf::from("target");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_is_jsonl_under_test_logs() {
        if std::env::var(LOG_FILE_ENV).is_ok() {
            return;
        }
        let path = test_log_path();
        assert_eq!(path.file_name().unwrap(), DEFAULT_LOG_NAME);
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "test-logs");
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_global_test_logging();
        init_global_test_logging();
        tracing::info!(target: "test", iteration = 1, "logging initialized");
    }
}
