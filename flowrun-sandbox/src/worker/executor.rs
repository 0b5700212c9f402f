//! Runs one flow script inside a fresh V8 isolate
//!
//! The isolate is created for a single run and dropped afterwards. A watchdog
//! thread terminates execution when the budget elapses; waits on async ops
//! are bounded by the same deadline.

use super::ops::{flow_extension, FileAccess, HostBinding, OutcomeSlot, ScriptOutcome, Terminator};
use super::sandbox::Sandbox;
use super::timing::PhaseTimer;
use crate::host::HostCallbacks;
use deno_core::error::CoreError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use flowrun_common::ScriptError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Message reported when a script returns without a terminal call.
pub const NO_OUTCOME_MESSAGE: &str = "flow completed without calling context.succeed or context.fail";

pub struct FlowExecutor {
    budget: Duration,
    max_heap_bytes: usize,
    host: Arc<dyn HostCallbacks>,
}

impl FlowExecutor {
    pub fn new(budget: Duration, max_heap_bytes: usize, host: Arc<dyn HostCallbacks>) -> Self {
        Self {
            budget,
            max_heap_bytes,
            host,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    fn create_runtime(&self, sandbox: &Sandbox) -> JsRuntime {
        let initial = (self.max_heap_bytes / 10).min(10 * 1024 * 1024);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![flow_extension()],
            create_params: Some(v8::CreateParams::default().heap_limits(initial, self.max_heap_bytes)),
            ..Default::default()
        });

        let terminator = Terminator(runtime.v8_isolate().thread_safe_handle());
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(OutcomeSlot::default());
        state.put(terminator);
        state.put(HostBinding {
            callbacks: self.host.clone(),
            scope: sandbox.scope.clone(),
        });
        state.put(FileAccess(sandbox.filesystem_root.clone()));
        drop(state);

        runtime
    }

    /// Execute the sandboxed script and return its single terminal outcome.
    pub async fn execute(&self, sandbox: Sandbox, timer: &mut PhaseTimer) -> Result<Value, ScriptError> {
        let mut runtime = self.create_runtime(&sandbox);
        timer.mark("isolate");

        let entry = format!(
            "({})(Deno.core.ops, {}, {}, {});",
            BOOTSTRAP_JS,
            to_js_literal(&sandbox.seed)?,
            to_js_literal(&Value::String(sandbox.source.clone()))?,
            to_js_literal(&sandbox.invocation_json())?,
        );

        let deadline = Instant::now() + self.budget;
        let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = timed_out.clone();
        let budget = self.budget;
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(budget) {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        let engine_error = match runtime.execute_script("[flowrun:main]", entry) {
            Ok(_) if settled(&mut runtime) => None,
            Ok(_) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(
                    remaining,
                    runtime.run_event_loop(PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(engine_failure(&e)),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        None
                    }
                }
            }
            Err(e) => Some(ScriptError::script(e.to_string())),
        };

        // The watchdog must be gone before the isolate is dropped.
        let _ = cancel_tx.send(());
        let _ = watchdog.join();
        timer.mark("execute");

        let outcome = runtime
            .op_state()
            .borrow_mut()
            .try_borrow_mut::<OutcomeSlot>()
            .and_then(OutcomeSlot::take);

        match outcome {
            Some(ScriptOutcome::Succeeded(result)) => Ok(result),
            Some(ScriptOutcome::Failed(error)) => Err(error),
            None if timed_out.load(Ordering::SeqCst) => Err(ScriptError::timeout(format!(
                "flow execution timed out after {}s",
                self.budget.as_secs()
            ))),
            None => match engine_error {
                Some(error) => {
                    tracing::warn!(error = %error.message, "Script ended with an engine error");
                    Err(error)
                }
                None => Err(ScriptError::script(NO_OUTCOME_MESSAGE)),
            },
        }
    }
}

/// Script exceptions keep their own message and stack; anything else is
/// reported by its description.
fn engine_failure(error: &CoreError) -> ScriptError {
    match error {
        CoreError::Js(js) => {
            let mut failure = ScriptError::script(
                js.message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| js.exception_message.clone()),
            );
            failure.stack = js.stack.clone();
            failure
        }
        other => ScriptError::script(other.to_string()),
    }
}

fn settled(runtime: &mut JsRuntime) -> bool {
    runtime
        .op_state()
        .borrow()
        .try_borrow::<OutcomeSlot>()
        .map(OutcomeSlot::is_settled)
        .unwrap_or(false)
}

/// JSON is a valid JavaScript expression, so data is spliced in as literals.
fn to_js_literal(value: &Value) -> Result<String, ScriptError> {
    serde_json::to_string(value)
        .map_err(|e| ScriptError::protocol(format!("failed to serialize sandbox data: {}", e)))
}
