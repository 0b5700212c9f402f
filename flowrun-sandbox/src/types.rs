//! Caller-facing result types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Successful outcome of one flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSuccess {
    /// Value the script passed to `context.succeed`
    pub result: Value,

    /// Wall-clock time from launch to outcome, measured by the controller
    pub duration_ms: u64,
}

impl RunSuccess {
    pub fn new(result: Value, duration: Duration) -> Self {
        Self {
            result,
            duration_ms: (duration.as_millis() as u64).max(1),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
