//! Time and memory budgets for one flow invocation

use flowrun_common::FlowDefinition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default margin between the worker's own budget and the controller's kill timer.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// Budgets derived from a flow and the runner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBudget {
    /// Wall-clock budget enforced inside the worker isolate
    pub script: Duration,

    /// Controller-side deadline after which the worker is killed
    pub kill_after: Duration,
}

impl ExecutionBudget {
    pub fn for_flow(flow: &FlowDefinition, grace: Duration) -> Self {
        let script = flow.effective_timeout();
        Self {
            script,
            kill_after: script + grace,
        }
    }

    /// Grace between the two timers
    pub fn grace(&self) -> Duration {
        self.kill_after.saturating_sub(self.script)
    }
}

/// V8 heap ceiling in bytes for a configured megabyte count.
pub fn heap_limit_bytes(max_heap_mb: usize) -> usize {
    max_heap_mb.max(16).saturating_mul(1024 * 1024)
}
