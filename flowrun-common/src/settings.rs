//! Settings forwarded to the worker inside each run request

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Default V8 heap ceiling for a worker isolate, in megabytes.
pub const DEFAULT_MAX_HEAP_MB: usize = 256;

/// Deployment environment of the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

/// Worker-side configuration, carried compressed in [`crate::RunRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    #[serde(default)]
    pub environment: Environment,

    /// Base URL of the host application's callback API.
    #[serde(default)]
    pub host_api_url: Option<String>,

    /// Read-only filesystem capability. Ignored in production.
    #[serde(default)]
    pub allow_filesystem: bool,

    #[serde(default)]
    pub filesystem_root: Option<PathBuf>,

    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: usize,

    /// Exposed to scripts as `context.parameters`.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_max_heap_mb() -> usize {
    DEFAULT_MAX_HEAP_MB
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            host_api_url: None,
            allow_filesystem: false,
            filesystem_root: None,
            max_heap_mb: DEFAULT_MAX_HEAP_MB,
            parameters: Map::new(),
        }
    }
}

impl WorkerSettings {
    /// Root a script may read from, or `None` when the capability is off.
    pub fn filesystem_root(&self) -> Option<&PathBuf> {
        if self.environment.is_production() || !self.allow_filesystem {
            return None;
        }
        self.filesystem_root.as_ref()
    }
}
