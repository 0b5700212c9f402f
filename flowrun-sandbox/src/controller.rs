//! Execution controller
//!
//! [`FlowRunner`] launches one worker process per invocation, ships it a
//! single run request and supervises the process until exactly one outcome
//! is known. The caller gets that outcome through a [`PendingRun`].

use crate::compile::{ScriptCompiler, V8SyntaxChecker};
use crate::config::{ConfigError, RunnerConfig};
use crate::execution::{ExecutionHandle, ExecutionId, InFlightGuard, PendingRun};
use crate::limits::ExecutionBudget;
use crate::types::RunSuccess;
use flowrun_common::{
    decode_frame, encode_frame, FlowDefinition, FlowError, FlowResult, MessageInstance,
    RunRequest, WorkerReply, WorkerRequest,
};
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

/// Something the supervisor has to react to
#[derive(Debug)]
enum WorkerEvent {
    Reply(WorkerReply),
    Malformed(String),
    StdoutClosed,
    TimedOut,
}

/// Runs flows, one worker process per invocation.
///
/// A runner accepts one invocation at a time; use several runners for
/// concurrent work.
pub struct FlowRunner {
    config: Arc<RunnerConfig>,
    compiler: Arc<dyn ScriptCompiler>,
    in_flight: Arc<AtomicBool>,
}

impl FlowRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
            compiler: Arc::new(V8SyntaxChecker::new()),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(RunnerConfig::from_env()?))
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run a flow to completion.
    pub async fn run(
        &self,
        flow: FlowDefinition,
        message: MessageInstance,
        transaction_id: Option<String>,
    ) -> FlowResult<RunSuccess> {
        self.start(flow, message, transaction_id).await?.await
    }

    /// Like [`FlowRunner::run`], for callers holding untyped JSON.
    pub async fn run_value(
        &self,
        flow: Value,
        message: Value,
        transaction_id: Option<String>,
    ) -> FlowResult<RunSuccess> {
        let flow = FlowDefinition::from_value(flow)?;
        let message = MessageInstance::from_value(message)?;
        self.run(flow, message, transaction_id).await
    }

    /// Validate, compile and launch. Returns once the worker is running.
    pub async fn start(
        &self,
        mut flow: FlowDefinition,
        message: MessageInstance,
        transaction_id: Option<String>,
    ) -> FlowResult<PendingRun> {
        flow.validate(&message)?;
        let guard = InFlightGuard::acquire(&self.in_flight).ok_or(FlowError::Busy)?;

        if self.config.precompile {
            flow.script = self.compiler.compile(&flow).await?;
        }

        let budget = ExecutionBudget::for_flow(&flow, self.config.kill_grace);
        let request = RunRequest::new(
            flow.clone(),
            &message,
            &self.config.worker_settings(),
            transaction_id.clone(),
        )
        .map_err(|e| FlowError::Protocol(format!("failed to encode run request: {}", e)))?;
        let frame = encode_frame(&WorkerRequest::Run(request))
            .map_err(|e| FlowError::Protocol(format!("failed to encode run request: {}", e)))?;

        let program = self.config.worker_program();
        let mut command = Command::new(&program);
        command.args(&self.config.worker_args);
        if self.config.debug_enabled() {
            command.arg("--debug");
        }
        command
            .env_clear()
            .envs(self.config.worker_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(FlowError::Launch)?;
        let pid = child.id();

        let execution_id = ExecutionId::new();
        let span = tracing::info_span!(
            "flow_run",
            flow_id = %flow.label(),
            transaction_id = transaction_id.as_deref().unwrap_or(""),
            execution_id = %execution_id,
        );
        span.in_scope(|| {
            tracing::info!(
                pid = pid.unwrap_or_default(),
                program = %program.display(),
                timeout_secs = budget.script.as_secs(),
                kill_after_ms = budget.kill_after.as_millis() as u64,
                "Worker launched"
            );
        });

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (events_tx, events_rx) = mpsc::channel(16);
        let (settle_tx, settle_rx) = oneshot::channel();
        let mut handle = ExecutionHandle::new(execution_id, child, settle_tx, Some(guard), started);

        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            handle.finish(Err(FlowError::Protocol(
                "worker stdio was not captured".to_string(),
            )));
            return Ok(PendingRun::new(execution_id, pid, settle_rx));
        };

        tokio::spawn(write_request(stdin, frame).instrument(span.clone()));
        tokio::spawn(read_replies(stdout, events_tx.clone()));
        tokio::spawn(forward_stderr(stderr, self.config.clone(), pid).instrument(span.clone()));

        let timer_tx = events_tx;
        handle.set_timer(tokio::spawn(async move {
            tokio::time::sleep(budget.kill_after).await;
            let _ = timer_tx.send(WorkerEvent::TimedOut).await;
        }));

        tokio::spawn(supervise(handle, events_rx, budget).instrument(span));
        Ok(PendingRun::new(execution_id, pid, settle_rx))
    }
}

async fn write_request(mut stdin: ChildStdin, frame: String) {
    if let Err(e) = stdin.write_all(frame.as_bytes()).await {
        tracing::debug!(error = %e, "Failed to write run request");
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "Failed to close worker stdin");
    }
}

async fn read_replies(stdout: ChildStdout, events: mpsc::Sender<WorkerEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_frame::<WorkerReply>(&line) {
                Ok(reply) => WorkerEvent::Reply(reply),
                Err(e) => WorkerEvent::Malformed(format!("malformed worker reply: {}", e)),
            },
            Ok(None) => {
                let _ = events.send(WorkerEvent::StdoutClosed).await;
                return;
            }
            Err(e) => WorkerEvent::Malformed(format!("failed to read worker output: {}", e)),
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, config: Arc<RunnerConfig>, pid: Option<u32>) {
    let pid = pid.unwrap_or_default();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() || config.is_filtered(&line) {
            continue;
        }
        tracing::info!(target: "flowrun::worker", pid, "{}", line);
    }
}

async fn supervise(
    mut handle: ExecutionHandle,
    mut events: mpsc::Receiver<WorkerEvent>,
    budget: ExecutionBudget,
) {
    let deadline = tokio::time::Instant::now() + budget.kill_after.saturating_sub(handle.elapsed());

    let outcome = loop {
        let Some(event) = events.recv().await else {
            break Err(FlowError::Protocol(
                "worker supervision channel closed".to_string(),
            ));
        };
        match event {
            WorkerEvent::Reply(reply) => {
                tracing::info!(success = reply.is_success(), "Worker reply received");
                break match reply {
                    WorkerReply::RunSuccess { result, .. } => {
                        Ok(RunSuccess::new(result, handle.elapsed()))
                    }
                    WorkerReply::RunFailure { error } => {
                        Err(FlowError::from_worker(error, budget.script))
                    }
                };
            }
            WorkerEvent::Malformed(message) => {
                tracing::warn!(error = %message, "Discarding worker output");
                break Err(FlowError::Protocol(message));
            }
            WorkerEvent::StdoutClosed => {
                // No reply is coming. Whatever the exit status says is the outcome.
                let waited = tokio::time::timeout_at(deadline, handle.child_mut().wait()).await;
                break match waited {
                    Ok(Ok(status)) => Err(FlowError::ProcessExit {
                        code: status.code(),
                        signal: exit_signal(&status),
                    }),
                    Ok(Err(e)) => Err(FlowError::Protocol(format!("failed to reap worker: {}", e))),
                    Err(_) => Err(FlowError::Timeout { after: budget.script }),
                };
            }
            WorkerEvent::TimedOut => {
                tracing::warn!(
                    kill_after_ms = budget.kill_after.as_millis() as u64,
                    "Kill timer fired, terminating worker"
                );
                break Err(FlowError::Timeout { after: budget.script });
            }
        }
    };

    let duration_ms = handle.elapsed().as_millis() as u64;
    match &outcome {
        Ok(_) => tracing::info!(duration_ms, "Flow succeeded"),
        Err(e) => tracing::info!(duration_ms, kind = %e.kind(), error = %e, "Flow failed"),
    }
    handle.finish(outcome);

    match handle.child_mut().wait().await {
        Ok(status) if status.success() => tracing::debug!("Worker exited"),
        Ok(status) => tracing::debug!(
            code = ?status.code(),
            signal = ?exit_signal(&status),
            "Worker exited abnormally"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to reap worker"),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
