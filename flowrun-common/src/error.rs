//! Error taxonomy shared by the controller and the worker

use crate::protocol::{FailureKind, ScriptError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Every way a flow run can end badly.
///
/// All failures of one invocation funnel into this type. None of them are
/// retried by the engine.
#[derive(Error, Debug)]
pub enum FlowError {
    /// The flow or message was malformed. Raised before any process exists.
    #[error("invalid flow configuration: {0}")]
    Configuration(String),

    /// The script source was rejected by the ahead-of-time compile step.
    #[error("flow script failed to compile: {0}")]
    Compile(String),

    /// The script (or its handler) threw, or called `context.fail`.
    #[error("{}", .0.message)]
    ScriptThrown(ScriptError),

    /// No outcome arrived within the execution budget.
    #[error("flow execution timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// The worker exited without reporting an outcome.
    #[error("worker process exited without reporting an outcome (code: {code:?}, signal: {signal:?})")]
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// A message crossing the process boundary could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The runner already has an invocation in flight.
    #[error("a flow run is already in progress on this runner")]
    Busy,

    /// The worker program could not be started.
    #[error("failed to launch worker process: {0}")]
    Launch(#[source] std::io::Error),
}

/// Discriminant of [`FlowError`], convenient for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Compile,
    ScriptThrown,
    Timeout,
    ProcessExit,
    Protocol,
    Busy,
    Launch,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Compile => "compile",
            ErrorKind::ScriptThrown => "script_thrown",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessExit => "process_exit",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Busy => "busy",
            ErrorKind::Launch => "launch",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Configuration(_) => ErrorKind::Configuration,
            FlowError::Compile(_) => ErrorKind::Compile,
            FlowError::ScriptThrown(_) => ErrorKind::ScriptThrown,
            FlowError::Timeout { .. } => ErrorKind::Timeout,
            FlowError::ProcessExit { .. } => ErrorKind::ProcessExit,
            FlowError::Protocol(_) => ErrorKind::Protocol,
            FlowError::Busy => ErrorKind::Busy,
            FlowError::Launch(_) => ErrorKind::Launch,
        }
    }

    /// Human readable message. For script failures this is exactly the
    /// message the script's error carried.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// JavaScript stack trace, when the failure came from script code.
    pub fn stack(&self) -> Option<&str> {
        match self {
            FlowError::ScriptThrown(err) => err.stack.as_deref(),
            _ => None,
        }
    }

    /// Partial result the script attached to its thrown error, if any.
    pub fn result(&self) -> Option<&Value> {
        match self {
            FlowError::ScriptThrown(err) => err.result.as_ref(),
            _ => None,
        }
    }

    /// Map a failure reported by the worker onto the caller-facing taxonomy.
    ///
    /// `budget` is the effective timeout of the flow, used when the worker
    /// reports that its own execution budget ran out.
    pub fn from_worker(error: ScriptError, budget: Duration) -> Self {
        match error.kind {
            FailureKind::Script => FlowError::ScriptThrown(error),
            FailureKind::Timeout => FlowError::Timeout { after: budget },
            FailureKind::Protocol => FlowError::Protocol(error.message),
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
