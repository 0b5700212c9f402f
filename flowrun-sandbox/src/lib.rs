//! Flowrun Sandbox - process-isolated execution of flow scripts
//!
//! The controller side ([`FlowRunner`]) spawns one `flowrun-worker` process per
//! invocation. The worker side ([`worker`]) evaluates the script in a fresh V8
//! isolate against a restricted `context` object and reports one outcome.

mod compile;
mod config;
mod controller;
mod execution;
mod host;
mod limits;
mod types;
mod utilities;
pub mod worker;

pub use compile::{ScriptCompiler, V8SyntaxChecker};
pub use config::{ConfigError, RunnerConfig, WORKER_BINARY};
pub use controller::FlowRunner;
pub use execution::{ExecutionHandle, ExecutionId, InFlightGuard, PendingRun};
pub use host::{
    HostCall, HostCallbacks, HostError, HostScope, HttpHostCallbacks, UnconfiguredHost,
    HOST_TOKEN_ENV,
};
pub use limits::{heap_limit_bytes, ExecutionBudget, DEFAULT_KILL_GRACE};
pub use types::RunSuccess;
pub use utilities::{DateUnit, UtilityError};

/// Re-export of the shared error taxonomy
pub use flowrun_common::{ErrorKind, FlowError, FlowResult};
