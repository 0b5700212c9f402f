//! Shared helpers for the flow runner integration tests

#![allow(dead_code)]

use flowrun_common::{Environment, FlowDefinition, MessageInstance};
use flowrun_sandbox::{FlowRunner, RunnerConfig};
use serde_json::Value;
use std::path::PathBuf;

/// Path of the worker binary built alongside these tests
pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_flowrun-worker"))
}

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("flowrun=debug,flowrun_sandbox=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration pointing at the real worker, outside production.
pub fn test_config() -> RunnerConfig {
    RunnerConfig {
        worker_program: Some(worker_binary()),
        environment: Environment::Test,
        ..RunnerConfig::default()
    }
}

pub fn runner() -> FlowRunner {
    setup_test_logging();
    FlowRunner::new(test_config())
}

/// A handler-style flow (runtime 1.1.0) with the given timeout.
pub fn handler_flow(script: &str, timeout_secs: u64) -> FlowDefinition {
    FlowDefinition::new(script)
        .with_runtime_version("1.1.0")
        .with_timeout(timeout_secs)
}

pub fn message(content: Value) -> MessageInstance {
    MessageInstance::new(content)
}
