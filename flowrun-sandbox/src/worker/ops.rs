//! Ops backing the `context` object inside the isolate
//!
//! The bootstrap script captures `Deno.core.ops` in closures and then deletes
//! `Deno`, so scripts only reach these through `context`.

use crate::host::{HostCall, HostCallbacks, HostScope};
use crate::utilities::{self, DateUnit};
use chrono::SecondsFormat;
use deno_core::{op2, v8, Extension, OpState};
use deno_error::JsErrorBox;
use flowrun_common::ScriptError;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

/// Terminal outcome recorded by `succeed`/`fail`
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    Succeeded(Value),
    Failed(ScriptError),
}

/// Holds the first terminal call. Later calls are ignored.
#[derive(Debug, Default)]
pub struct OutcomeSlot(Option<ScriptOutcome>);

impl OutcomeSlot {
    /// Record an outcome; returns false when one was already recorded.
    pub fn settle(&mut self, outcome: ScriptOutcome) -> bool {
        if self.0.is_some() {
            return false;
        }
        self.0 = Some(outcome);
        true
    }

    pub fn take(&mut self) -> Option<ScriptOutcome> {
        self.0.take()
    }

    pub fn is_settled(&self) -> bool {
        self.0.is_some()
    }
}

/// Stops the isolate once a terminal call has been recorded.
pub struct Terminator(pub v8::IsolateHandle);

/// Host dispatcher plus the scope captured by the sandbox builder
#[derive(Clone)]
pub struct HostBinding {
    pub callbacks: Arc<dyn HostCallbacks>,
    pub scope: HostScope,
}

/// Root for `readFile`, present only when the capability was granted.
pub struct FileAccess(pub Option<PathBuf>);

fn record(state: &mut OpState, outcome: ScriptOutcome) {
    let first = state
        .try_borrow_mut::<OutcomeSlot>()
        .map(|slot| slot.settle(outcome))
        .unwrap_or(false);

    if !first {
        tracing::debug!("Ignoring terminal call after the outcome was settled");
        return;
    }
    if let Some(terminator) = state.try_borrow::<Terminator>() {
        terminator.0.terminate_execution();
    }
}

#[op2]
fn op_flow_succeed(state: &mut OpState, #[serde] result: serde_json::Value) {
    record(state, ScriptOutcome::Succeeded(result));
}

#[op2]
fn op_flow_fail(state: &mut OpState, #[serde] error: serde_json::Value) {
    record(state, ScriptOutcome::Failed(ScriptError::from_js(error)));
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    level: String,
    message: String,
}

#[op2]
fn op_flow_log(#[serde] entry: LogEntry) {
    match entry.level.as_str() {
        "error" => tracing::error!(target: "flowrun::script", "{}", entry.message),
        "warn" => tracing::warn!(target: "flowrun::script", "{}", entry.message),
        "debug" => tracing::debug!(target: "flowrun::script", "{}", entry.message),
        _ => tracing::info!(target: "flowrun::script", "{}", entry.message),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum DateRequest {
    Now,
    Format {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        format: Option<String>,
    },
    Add {
        #[serde(default)]
        input: Value,
        amount: i64,
        unit: String,
    },
    Diff {
        from: Value,
        to: Value,
        unit: String,
    },
}

fn utility_error(e: utilities::UtilityError) -> JsErrorBox {
    JsErrorBox::type_error(e.to_string())
}

#[op2]
#[serde]
fn op_flow_dates(#[serde] request: DateRequest) -> Result<serde_json::Value, JsErrorBox> {
    let value = match request {
        DateRequest::Now => Value::String(utilities::now()),
        DateRequest::Format { input, format } => {
            Value::String(utilities::format_date(&input, format.as_deref()).map_err(utility_error)?)
        }
        DateRequest::Add {
            input,
            amount,
            unit,
        } => {
            let unit: DateUnit = unit.parse().map_err(utility_error)?;
            let shifted = utilities::add_to_date(&input, amount, unit).map_err(utility_error)?;
            Value::String(shifted.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        DateRequest::Diff { from, to, unit } => {
            let unit: DateUnit = unit.parse().map_err(utility_error)?;
            Value::from(utilities::date_diff(&from, &to, unit).map_err(utility_error)?)
        }
    };
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct JsonPathRequest {
    document: Value,
    path: String,
}

#[op2]
#[serde]
fn op_flow_json_path(#[serde] request: JsonPathRequest) -> Result<Vec<Value>, JsErrorBox> {
    utilities::json_path(&request.document, &request.path).map_err(utility_error)
}

#[derive(Debug, Deserialize)]
struct FakeRequest {
    kind: String,
    #[serde(default)]
    options: Value,
}

#[op2]
#[serde]
fn op_flow_fake(#[serde] request: FakeRequest) -> Result<serde_json::Value, JsErrorBox> {
    utilities::fake(&request.kind, &request.options).map_err(utility_error)
}

#[op2]
#[serde]
fn op_flow_parse_xml(#[string] text: String) -> Result<serde_json::Value, JsErrorBox> {
    utilities::parse_xml(&text).map_err(utility_error)
}

#[op2]
#[string]
fn op_flow_read_file(state: &mut OpState, #[string] path: String) -> Result<String, JsErrorBox> {
    let root = state
        .try_borrow::<FileAccess>()
        .and_then(|access| access.0.clone())
        .ok_or_else(|| JsErrorBox::generic("filesystem access is not enabled"))?;

    let resolved = resolve_under(&root, Path::new(&path))
        .map_err(|e| JsErrorBox::generic(format!("cannot read {}: {}", path, e)))?;
    tracing::debug!(path = %resolved.display(), "Script file read");

    std::fs::read_to_string(&resolved)
        .map_err(|e| JsErrorBox::generic(format!("cannot read {}: {}", path, e)))
}

/// Canonical path of `requested` if it lies inside `root`.
pub fn resolve_under(root: &Path, requested: &Path) -> std::io::Result<PathBuf> {
    let root = root.canonicalize()?;
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = candidate.canonicalize()?;
    if !resolved.starts_with(&root) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "path escapes the readable root",
        ));
    }
    Ok(resolved)
}

#[op2(async)]
#[serde]
async fn op_flow_host_call(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[serde] args: Vec<Value>,
) -> Result<serde_json::Value, JsErrorBox> {
    let binding = state
        .borrow()
        .try_borrow::<HostBinding>()
        .cloned()
        .ok_or_else(|| JsErrorBox::generic("host callbacks are not available"))?;

    let call = HostCall::from_js(&name, args).map_err(|e| JsErrorBox::type_error(e.to_string()))?;
    tracing::debug!(callback = call.name(), "Script host callback");

    binding
        .callbacks
        .call(&binding.scope, call)
        .await
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Extension registering every flow op
pub fn flow_extension() -> Extension {
    let ops = vec![
        op_flow_succeed(),
        op_flow_fail(),
        op_flow_log(),
        op_flow_dates(),
        op_flow_json_path(),
        op_flow_fake(),
        op_flow_parse_xml(),
        op_flow_read_file(),
        op_flow_host_call(),
    ];

    Extension {
        name: "flowrun_context",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_slot_keeps_first() {
        let mut slot = OutcomeSlot::default();
        assert!(slot.settle(ScriptOutcome::Succeeded(Value::from(1))));
        assert!(!slot.settle(ScriptOutcome::Failed(ScriptError::script("late"))));
        assert_eq!(slot.take(), Some(ScriptOutcome::Succeeded(Value::from(1))));
    }

    #[test]
    fn test_resolve_under_blocks_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("codes.csv"), "99213").unwrap();

        let ok = resolve_under(dir.path(), Path::new("codes.csv")).unwrap();
        assert!(ok.ends_with("codes.csv"));

        let err = resolve_under(dir.path(), Path::new("../../etc/passwd")).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
        ));
        assert!(resolve_under(dir.path(), Path::new("/etc/hostname")).is_err());
    }
}
