//! Worker side of the process boundary
//!
//! A worker process reads exactly one run request from stdin, executes it,
//! and writes exactly one reply to stdout before exiting. Logs go to stderr.

mod executor;
mod ops;
mod sandbox;
mod timing;

pub use executor::{FlowExecutor, NO_OUTCOME_MESSAGE};
pub use ops::{resolve_under, ScriptOutcome};
pub use sandbox::{Capability, Sandbox, SandboxBuilder};
pub use timing::PhaseTimer;

use crate::host::{HostCallbacks, HttpHostCallbacks, UnconfiguredHost};
use crate::limits::heap_limit_bytes;
use flowrun_common::{decode_frame, encode_frame, ScriptError, WorkerReply, WorkerRequest};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Exit status after a reply was written.
pub const EXIT_OK: i32 = 0;
/// Exit status when the request could not be read or decoded.
pub const EXIT_PROTOCOL: i32 = 65;
/// Exit status after a panic.
pub const EXIT_PANIC: i32 = 70;

/// Writes the single reply frame to stdout.
///
/// Clones share one flag, so whichever writer goes first (the normal path or
/// the panic hook) is the only one that reaches stdout.
#[derive(Clone, Default)]
pub struct ReplyWriter {
    sent: Arc<AtomicBool>,
}

impl ReplyWriter {
    pub fn stdout() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` if a reply was already written.
    pub fn send(&self, reply: &WorkerReply) -> std::io::Result<bool> {
        if self.sent.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let line = encode_frame(reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.flush()?;
        Ok(true)
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}

/// Report any panic as a failure reply, then exit.
pub fn install_panic_hook(replies: ReplyWriter) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = match info.payload().downcast_ref::<&str>() {
            Some(s) => s.to_string(),
            None => info
                .payload()
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unknown panic".to_string()),
        };
        let location = info
            .location()
            .map(|l| format!(" at {}:{}", l.file(), l.line()))
            .unwrap_or_default();

        let _ = replies.send(&WorkerReply::failure(ScriptError::script(format!(
            "flow worker crashed: {}{}",
            message, location
        ))));
        default_hook(info);
        std::process::exit(EXIT_PANIC);
    }));
}

/// Logging to stderr. Filter from `FLOWRUN_LOG`, then `RUST_LOG`.
pub fn init_logging(debug: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = if debug { "debug" } else { "warn" };
    let filter = std::env::var("FLOWRUN_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| tracing_subscriber::EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(true),
        )
        .with(filter)
        .try_init();
}

/// Read one request, run it, write one reply. Returns the process exit code.
pub async fn serve(replies: ReplyWriter) -> i32 {
    let mut timer = PhaseTimer::start();

    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
    let request = match read {
        Ok(0) => Err("no run request received on stdin".to_string()),
        Ok(_) => decode_frame::<WorkerRequest>(&line).map_err(|e| format!("malformed run request: {}", e)),
        Err(e) => Err(format!("failed to read run request: {}", e)),
    };
    let WorkerRequest::Run(request) = match request {
        Ok(request) => request,
        Err(message) => {
            tracing::error!(error = %message, "Rejecting run request");
            reply(&replies, WorkerReply::failure(ScriptError::protocol(message)));
            return EXIT_PROTOCOL;
        }
    };

    let decoded = request
        .message_instance()
        .and_then(|message| request.settings().map(|settings| (message, settings)));
    let (message, settings) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            let message = format!("failed to decode run request payload: {}", e);
            tracing::error!(error = %message, "Rejecting run request");
            reply(&replies, WorkerReply::failure(ScriptError::protocol(message)));
            return EXIT_PROTOCOL;
        }
    };
    timer.mark("decode");

    tracing::debug!(
        flow = %request.flow.label(),
        transaction_id = ?request.transaction_id,
        environment = ?settings.environment,
        "Run request received"
    );

    let outcome = match SandboxBuilder::new(&request.flow, &message, &settings)
        .transaction_id(request.transaction_id.clone())
        .build()
    {
        Ok(sandbox) => {
            timer.mark("sandbox");
            let host: Arc<dyn HostCallbacks> = match &settings.host_api_url {
                Some(url) => Arc::new(HttpHostCallbacks::from_env(url.clone())),
                None => Arc::new(UnconfiguredHost),
            };
            let executor = FlowExecutor::new(
                request.flow.effective_timeout(),
                heap_limit_bytes(settings.max_heap_mb),
                host,
            );
            executor.execute(sandbox, &mut timer).await
        }
        Err(error) => Err(error),
    };

    let response = match outcome {
        Ok(result) => WorkerReply::success(result, timer.elapsed_ms()),
        Err(error) => WorkerReply::failure(error),
    };
    timer.log();

    reply(&replies, response);
    EXIT_OK
}

fn reply(replies: &ReplyWriter, reply: WorkerReply) {
    match replies.send(&reply) {
        Ok(true) => tracing::debug!(success = reply.is_success(), "Reply written"),
        Ok(false) => tracing::warn!("Reply already written, dropping a second one"),
        Err(e) => tracing::error!(error = %e, "Failed to write reply"),
    }
}
