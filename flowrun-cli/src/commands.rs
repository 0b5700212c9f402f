//! CLI command implementations
//!
//! The outer `Result` covers problems with the inputs themselves (unreadable
//! files, bad configuration). The inner `FlowResult` is the flow's outcome.

use anyhow::{Context, Result};
use flowrun_common::{FlowDefinition, FlowError, FlowResult, MessageInstance};
use flowrun_sandbox::{FlowRunner, RunSuccess, RunnerConfig, ScriptCompiler, V8SyntaxChecker};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

/// Read a JSON document from disk
pub fn load_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Explicit file first, else the environment.
pub fn load_config(path: Option<&Path>, worker: Option<PathBuf>) -> Result<RunnerConfig> {
    let mut config = match path {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::from_env()?,
    };
    if worker.is_some() {
        config.worker_program = worker;
    }
    Ok(config)
}

pub async fn execute_run(
    flow_path: &Path,
    message_path: &Path,
    transaction_id: Option<String>,
    config_path: Option<&Path>,
    worker: Option<PathBuf>,
) -> Result<FlowResult<RunSuccess>> {
    let flow = load_json(flow_path)?;
    let message = load_json(message_path)?;
    let config = load_config(config_path, worker)?;

    info!(
        flow = %flow_path.display(),
        worker = %config.worker_program().display(),
        "Running flow"
    );
    let runner = FlowRunner::new(config);
    Ok(runner.run_value(flow, message, transaction_id).await)
}

pub async fn execute_check(flow_path: &Path) -> Result<FlowResult<()>> {
    let flow = match FlowDefinition::from_value(load_json(flow_path)?) {
        Ok(flow) => flow,
        Err(e) => return Ok(Err(e)),
    };
    if let Err(e) = flow.validate(&MessageInstance::default()) {
        return Ok(Err(e));
    }

    let compiler = V8SyntaxChecker::new();
    info!(flow = %flow.label(), compiler = compiler.name(), "Checking flow");
    Ok(compiler.compile(&flow).await.map(|_| ()))
}

pub fn success_report(success: &RunSuccess) -> Value {
    json!({
        "result": success.result,
        "durationMs": success.duration_ms,
    })
}

pub fn error_report(error: &FlowError) -> Value {
    let mut report = json!({
        "kind": error.kind().as_str(),
        "message": error.message(),
    });
    if let Some(stack) = error.stack() {
        report["stack"] = json!(stack);
    }
    if let Some(result) = error.result() {
        report["result"] = result.clone();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_common::ScriptError;
    use std::io::Write;

    #[test]
    fn test_error_report_includes_partial_result() {
        let mut script_error = ScriptError::script("half done");
        script_error.result = Some(json!({ "processed": 3 }));
        let report = error_report(&FlowError::ScriptThrown(script_error));

        assert_eq!(report["kind"], "script_thrown");
        assert_eq!(report["message"], "half done");
        assert_eq!(report["result"], json!({ "processed": 3 }));
        assert!(report.get("stack").is_none());
    }

    #[test]
    fn test_worker_flag_overrides_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_program = \"/opt/a\"").unwrap();

        let config = load_config(Some(file.path()), Some(PathBuf::from("/opt/b"))).unwrap();
        assert_eq!(config.worker_program(), PathBuf::from("/opt/b"));
    }

    #[tokio::test]
    async fn test_check_reports_syntax_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!({ "script": "function index( {" })).unwrap();

        let outcome = execute_check(file.path()).await.unwrap();
        assert!(matches!(outcome, Err(FlowError::Compile(_))));
    }

    #[tokio::test]
    async fn test_check_rejects_raw_string_flow() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "\"context.succeed(1)\"").unwrap();

        let outcome = execute_check(file.path()).await.unwrap();
        assert!(matches!(outcome, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_unreadable_input_is_an_input_error() {
        assert!(load_json(Path::new("/nonexistent/flow.json")).is_err());
    }
}
