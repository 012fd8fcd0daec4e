//! End-to-end tests driving the public training API
//!
//! These runs use tiny networks on a synthetic dataset so that whole
//! training budgets finish in seconds on CPU.
//!
//! Run with: cargo test --test integration

mod ada_tests;
mod distributed_tests;
mod fixtures;
mod workflow_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("adagan=debug")
        .try_init();
}
