//! Controller-side state of one in-flight invocation

use crate::types::RunSuccess;
use flowrun_common::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marks a runner as busy for as long as it is alive.
#[derive(Debug)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// `None` if the flag is already held.
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the worker process, the pending settlement and the kill timer.
///
/// Settlement and teardown are both idempotent; teardown also runs on drop.
pub struct ExecutionHandle {
    id: ExecutionId,
    child: Child,
    pid: Option<u32>,
    settle: Option<oneshot::Sender<FlowResult<RunSuccess>>>,
    timer: Option<JoinHandle<()>>,
    guard: Option<InFlightGuard>,
    started: Instant,
    torn_down: bool,
}

impl ExecutionHandle {
    pub fn new(
        id: ExecutionId,
        child: Child,
        settle: oneshot::Sender<FlowResult<RunSuccess>>,
        guard: Option<InFlightGuard>,
        started: Instant,
    ) -> Self {
        let pid = child.id();
        Self {
            id,
            child,
            pid,
            settle: Some(settle),
            timer: None,
            guard,
            started,
            torn_down: false,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub fn set_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settle.is_none()
    }

    /// Resolve the pending run. Only the first call has any effect.
    pub fn settle(&mut self, outcome: FlowResult<RunSuccess>) -> bool {
        let Some(sender) = self.settle.take() else {
            tracing::debug!(execution_id = %self.id, "Ignoring second settlement");
            return false;
        };
        if sender.send(outcome).is_err() {
            tracing::debug!(execution_id = %self.id, "Caller dropped the pending run");
        }
        true
    }

    /// Cancel the timer, kill the worker and release the runner.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // Killing an already-exited child is a no-op.
        if let Err(e) = self.child.start_kill() {
            tracing::trace!(execution_id = %self.id, error = %e, "Worker already gone");
        }
        self.guard.take();
    }

    /// Tear down, then settle. The runner is free again before the caller wakes.
    pub fn finish(&mut self, outcome: FlowResult<RunSuccess>) -> bool {
        self.teardown();
        self.settle(outcome)
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.teardown();
        if !self.is_settled() {
            self.settle(Err(FlowError::Protocol(
                "execution ended without an outcome".to_string(),
            )));
        }
    }
}

/// A launched run whose outcome has not arrived yet.
///
/// Awaiting it yields the single settlement of the invocation.
#[derive(Debug)]
pub struct PendingRun {
    id: ExecutionId,
    pid: Option<u32>,
    receiver: oneshot::Receiver<FlowResult<RunSuccess>>,
}

impl PendingRun {
    pub fn new(id: ExecutionId, pid: Option<u32>, receiver: oneshot::Receiver<FlowResult<RunSuccess>>) -> Self {
        Self { id, pid, receiver }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// OS process id of the worker, if it was still running at launch.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Future for PendingRun {
    type Output = FlowResult<RunSuccess>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(FlowError::Protocol(
                    "execution supervisor stopped without an outcome".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_guard_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = InFlightGuard::acquire(&flag).unwrap();
        assert!(InFlightGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(InFlightGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_settles_once_and_tears_down_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let mut handle = ExecutionHandle::new(
            ExecutionId::new(),
            sleeper(),
            tx,
            InFlightGuard::acquire(&flag),
            Instant::now(),
        );
        let pending = PendingRun::new(handle.id(), handle.pid(), rx);

        assert!(handle.finish(Ok(RunSuccess::new(json!(1), Duration::from_millis(5)))));
        assert!(!flag.load(Ordering::SeqCst));
        assert!(!handle.finish(Err(FlowError::Busy)));
        handle.teardown();

        let status = handle.child_mut().wait().await.unwrap();
        assert!(!status.success());

        assert_eq!(pending.await.unwrap().result, json!(1));
    }

    #[tokio::test]
    async fn test_dropped_handle_settles_pending_run() {
        let (tx, rx) = oneshot::channel();
        let handle = ExecutionHandle::new(ExecutionId::new(), sleeper(), tx, None, Instant::now());
        let pending = PendingRun::new(handle.id(), handle.pid(), rx);
        drop(handle);

        assert_matches!(pending.await, Err(FlowError::Protocol(_)));
    }
}
