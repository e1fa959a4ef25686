//! Test support shared by the workspace crates.

pub mod log;

pub use log::{init_global_test_logging, test_log_path};
