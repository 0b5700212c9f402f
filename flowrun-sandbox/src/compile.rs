//! Ahead-of-time script compilation, outside the isolation boundary

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use flowrun_common::{FlowDefinition, FlowError, FlowResult};

/// Turns a flow's script into the source shipped to the worker.
///
/// JavaScript is only syntax-checked; a dialect that needs transpiling would
/// return the transpiled output.
#[async_trait]
pub trait ScriptCompiler: Send + Sync {
    async fn compile(&self, flow: &FlowDefinition) -> FlowResult<String>;

    fn name(&self) -> &str;
}

/// Parses the script in a throwaway isolate without running it.
#[derive(Debug, Default, Clone, Copy)]
pub struct V8SyntaxChecker;

impl V8SyntaxChecker {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous check; `Err` carries V8's message and line.
    pub fn check(source: &str) -> Result<(), String> {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        let scope = &mut runtime.handle_scope();
        let code = v8::String::new(scope, source)
            .ok_or_else(|| "script source is too large".to_string())?;

        let tc = &mut v8::TryCatch::new(scope);
        if v8::Script::compile(tc, code, None).is_some() {
            return Ok(());
        }

        let text = tc
            .exception()
            .map(|exception| exception.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "SyntaxError".to_string());
        let line = tc.message().and_then(|message| message.get_line_number(tc));
        Err(match line {
            Some(line) => format!("{} (line {})", text, line),
            None => text,
        })
    }
}

#[async_trait]
impl ScriptCompiler for V8SyntaxChecker {
    async fn compile(&self, flow: &FlowDefinition) -> FlowResult<String> {
        let source = flow.script.clone();
        let checked = source.clone();
        tokio::task::spawn_blocking(move || Self::check(&checked))
            .await
            .map_err(|e| FlowError::Compile(format!("compile task failed: {}", e)))?
            .map_err(FlowError::Compile)?;

        tracing::debug!(flow = %flow.label(), bytes = source.len(), "Script compiled");
        Ok(source)
    }

    fn name(&self) -> &str {
        "v8-syntax"
    }
}
