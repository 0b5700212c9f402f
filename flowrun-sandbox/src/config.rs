//! Runner configuration

use crate::limits::DEFAULT_KILL_GRACE;
use flowrun_common::settings::DEFAULT_MAX_HEAP_MB;
use flowrun_common::{Environment, WorkerSettings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the worker binary looked up next to the current executable.
pub const WORKER_BINARY: &str = "flowrun-worker";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Controller-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker executable. Resolved by [`RunnerConfig::worker_program`] when unset.
    pub worker_program: Option<PathBuf>,

    /// Extra arguments placed before the worker's own flags
    pub worker_args: Vec<String>,

    /// Margin between the flow timeout and the hard kill
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    pub environment: Environment,

    /// Verbose worker logging. Ignored in production.
    pub debug: bool,

    /// Variables copied from the controller's environment into the worker's
    pub env_allowlist: Vec<String>,

    /// Worker stderr lines containing any of these are not logged
    pub stderr_filters: Vec<String>,

    pub host_api_url: Option<String>,

    pub allow_filesystem: bool,

    pub filesystem_root: Option<PathBuf>,

    pub max_heap_mb: usize,

    /// Run the ahead-of-time compile check before spawning
    pub precompile: bool,

    /// Exposed to scripts as `context.parameters`
    pub parameters: Map<String, Value>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: Vec::new(),
            kill_grace: DEFAULT_KILL_GRACE,
            environment: Environment::default(),
            debug: false,
            env_allowlist: default_env_allowlist(),
            stderr_filters: vec!["DeprecationWarning".to_string()],
            host_api_url: None,
            allow_filesystem: false,
            filesystem_root: None,
            max_heap_mb: DEFAULT_MAX_HEAP_MB,
            precompile: true,
            parameters: Map::new(),
        }
    }
}

fn default_env_allowlist() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "LANG",
        "TZ",
        "RUST_LOG",
        "RUST_BACKTRACE",
        "FLOWRUN_LOG",
        "FLOWRUN_HOST_TOKEN",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

impl RunnerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RunnerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file named by `FLOWRUN_CONFIG`, then the
    /// `FLOWRUN_WORKER` and `FLOWRUN_ENV` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FLOWRUN_CONFIG") {
            Some(path) => Self::load(PathBuf::from(path))?,
            None => Self::default(),
        };

        if let Some(worker) = std::env::var_os("FLOWRUN_WORKER") {
            config.worker_program = Some(PathBuf::from(worker));
        }
        if let Ok(env) = std::env::var("FLOWRUN_ENV") {
            config.environment = env.parse().map_err(ConfigError::Invalid)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_mb == 0 {
            return Err(ConfigError::Invalid("max_heap_mb must be positive".to_string()));
        }
        if let Some(url) = &self.host_api_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "host_api_url must be an http(s) URL: {}",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Worker executable: explicit setting, else `flowrun-worker` beside the
    /// current executable.
    pub fn worker_program(&self) -> PathBuf {
        if let Some(program) = &self.worker_program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
    }

    /// Debug only takes effect outside production.
    pub fn debug_enabled(&self) -> bool {
        self.debug && !self.environment.is_production()
    }

    /// Allow-listed variables present in the controller's environment.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        self.env_allowlist
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }

    /// Settings shipped to the worker with each request.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            environment: self.environment,
            host_api_url: self.host_api_url.clone(),
            allow_filesystem: self.allow_filesystem,
            filesystem_root: self.filesystem_root.clone(),
            max_heap_mb: self.max_heap_mb,
            parameters: self.parameters.clone(),
        }
    }

    /// Whether a worker stderr line should be dropped from the log
    pub fn is_filtered(&self, line: &str) -> bool {
        self.stderr_filters
            .iter()
            .any(|needle| !needle.is_empty() && line.contains(needle.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.kill_grace, Duration::from_secs(1));
        assert!(config.environment.is_production());
        assert!(config.precompile);
        assert!(config.env_allowlist.iter().any(|name| name == "PATH"));
    }

    #[test]
    fn test_parse_toml_with_humantime() {
        let config = RunnerConfig::from_toml(
            r#"
            kill_grace = "1500ms"
            environment = "development"
            debug = true
            stderr_filters = ["DeprecationWarning", "ExperimentalWarning"]

            [parameters]
            billing_region = "us-east"
            "#,
        )
        .unwrap();

        assert_eq!(config.kill_grace, Duration::from_millis(1500));
        assert_eq!(config.environment, Environment::Development);
        assert!(config.debug_enabled());
        assert_eq!(config.parameters["billing_region"], "us-east");
        assert!(config.is_filtered("(node) ExperimentalWarning: fetch"));
        assert!(!config.is_filtered("flow started"));
    }

    #[test]
    fn test_debug_ignored_in_production() {
        let config = RunnerConfig {
            debug: true,
            ..Default::default()
        };
        assert!(!config.debug_enabled());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_matches!(
            RunnerConfig::from_toml("max_heap_mb = 0"),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            RunnerConfig::from_toml("host_api_url = \"ftp://host\""),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            RunnerConfig::from_toml("kill_grace = 12"),
            Err(ConfigError::Parse(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_program = \"/opt/flowrun/bin/flowrun-worker\"").unwrap();
        writeln!(file, "max_heap_mb = 64").unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(
            config.worker_program(),
            PathBuf::from("/opt/flowrun/bin/flowrun-worker")
        );
        assert_eq!(config.worker_settings().max_heap_mb, 64);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = RunnerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
