mod common;

mod cli_tests;
mod fault_tests;
mod lifecycle_tests;
mod parameter_tests;

#[ctor::ctor]
fn init_logging() {
    chaos_common::testing::init_global_test_logging();
}
