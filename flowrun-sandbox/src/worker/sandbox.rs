//! The capability set handed to one script invocation

use crate::host::HostScope;
use flowrun_common::{FlowDefinition, InvocationStyle, MessageInstance, ScriptError, WorkerSettings};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Something a script is allowed to do besides pure computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Dates,
    JsonPath,
    FakeData,
    Xml,
    HostCallbacks,
    /// Read-only access below the configured root. Never granted in production.
    ReadFile,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Dates => "dates",
            Capability::JsonPath => "jsonPath",
            Capability::FakeData => "fake",
            Capability::Xml => "xml",
            Capability::HostCallbacks => "host",
            Capability::ReadFile => "readFile",
        }
    }
}

/// Everything the executor needs to run one script, and nothing more.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub scope: HostScope,
    pub capabilities: BTreeSet<Capability>,
    /// Plain data copied into the isolate: message, flow, parsed content,
    /// parameters and the capability names.
    pub seed: Value,
    pub source: String,
    pub invocation: InvocationStyle,
    pub filesystem_root: Option<PathBuf>,
}

impl Sandbox {
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Entry convention as passed to the bootstrap script.
    pub fn invocation_json(&self) -> Value {
        match &self.invocation {
            InvocationStyle::Legacy => json!({ "mode": "legacy" }),
            InvocationStyle::Handler(name) => json!({ "mode": "handler", "handler": name }),
        }
    }
}

pub struct SandboxBuilder<'a> {
    flow: &'a FlowDefinition,
    message: &'a MessageInstance,
    settings: &'a WorkerSettings,
    transaction_id: Option<String>,
}

impl<'a> SandboxBuilder<'a> {
    pub fn new(flow: &'a FlowDefinition, message: &'a MessageInstance, settings: &'a WorkerSettings) -> Self {
        Self {
            flow,
            message,
            settings,
            transaction_id: None,
        }
    }

    pub fn transaction_id(mut self, transaction_id: Option<String>) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn build(self) -> Result<Sandbox, ScriptError> {
        // Handler names are spliced into evaluated source.
        self.flow
            .validate(self.message)
            .map_err(|e| ScriptError::script(e.to_string()))?;

        let filesystem_root = self.settings.filesystem_root().cloned();
        let mut capabilities: BTreeSet<Capability> = [
            Capability::Dates,
            Capability::JsonPath,
            Capability::FakeData,
            Capability::Xml,
            Capability::HostCallbacks,
        ]
        .into_iter()
        .collect();
        if filesystem_root.is_some() {
            capabilities.insert(Capability::ReadFile);
        }

        let scope = HostScope {
            org_id: self.flow.org_id.clone(),
            facility_id: self.flow.facility_id.clone(),
            flow_id: self.flow.id.clone(),
            transaction_id: self.transaction_id.clone(),
        };

        let seed = json!({
            "messageInstance": self.message,
            "flow": self.flow,
            "content": self.message.content_value(),
            "parameters": self.settings.parameters,
            "transactionId": self.transaction_id,
            "capabilities": capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        });

        Ok(Sandbox {
            scope,
            capabilities,
            seed,
            source: self.flow.script.clone(),
            invocation: self.flow.invocation(self.message),
            filesystem_root,
        })
    }
}
