//! Flow definitions and their execution policy

use crate::error::FlowError;
use crate::message::MessageInstance;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Budget applied when a flow declares no usable timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Hard ceiling on any declared timeout.
pub const MAX_TIMEOUT_SECS: u64 = 1200;

/// Handler invoked when neither the flow nor the request names one.
pub const DEFAULT_HANDLER: &str = "index";

/// First runtime version that uses the handler convention.
pub const HANDLER_RUNTIME_VERSION: semver::Version = semver::Version::new(1, 1, 0);

/// Script dialect of a flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    #[serde(alias = "js", alias = "ecmascript")]
    JavaScript,
}

impl ScriptLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptLanguage::JavaScript => "javascript",
        }
    }
}

/// An organization-configured script plus its execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Script source
    pub script: String,

    #[serde(default)]
    pub language: ScriptLanguage,

    /// Declared timeout in seconds. Kept as raw JSON because flows in the
    /// wild carry numbers, numeric strings and garbage here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,

    #[serde(default)]
    pub runtime_version: Option<String>,

    #[serde(default)]
    pub default_handler: Option<String>,

    #[serde(default)]
    pub org_id: Option<String>,

    #[serde(default)]
    pub facility_id: Option<String>,

    /// Anything else the caller stored on the flow; passed through to the script.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How the script is entered, decided once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStyle {
    /// The raw body runs at global scope and reports its own outcome.
    Legacy,
    /// A named function is called with `(context, content)`.
    Handler(String),
}

impl FlowDefinition {
    /// Create a flow around a script with every policy field left at its default.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            script: script.into(),
            language: ScriptLanguage::default(),
            timeout: None,
            runtime_version: None,
            default_handler: None,
            org_id: None,
            facility_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_timeout(mut self, secs: impl Into<Value>) -> Self {
        self.timeout = Some(secs.into());
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    pub fn with_default_handler(mut self, handler: impl Into<String>) -> Self {
        self.default_handler = Some(handler.into());
        self
    }

    pub fn with_scope(mut self, org_id: impl Into<String>, facility_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self.facility_id = Some(facility_id.into());
        self
    }

    /// Parse an untyped flow, refusing anything that is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        if !value.is_object() {
            return Err(FlowError::Configuration(format!(
                "flow must be a structured object, got {}",
                json_type_name(&value)
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| FlowError::Configuration(format!("malformed flow definition: {}", e)))
    }

    /// Identifier used in logs.
    pub fn label(&self) -> &str {
        self.id
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("<anonymous>")
    }

    /// `min(declared, 1200)` seconds; 5 seconds when the declaration is
    /// missing, zero, negative or not an integer.
    pub fn effective_timeout(&self) -> Duration {
        let declared = match &self.timeout {
            Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().and_then(whole_secs)),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.parse::<u64>().ok().or_else(|| s.parse::<f64>().ok().and_then(whole_secs))
            }
            _ => None,
        };
        let secs = declared
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_TIMEOUT_SECS, |secs| secs.min(MAX_TIMEOUT_SECS));
        Duration::from_secs(secs)
    }

    /// Parsed runtime version. Partial versions such as `"1.1"` are padded.
    pub fn runtime_version(&self) -> Option<semver::Version> {
        self.runtime_version.as_deref().and_then(parse_loose_version)
    }

    /// Whether the flow uses the handler convention (runtime >= 1.1.0).
    pub fn uses_handler(&self) -> bool {
        self.runtime_version()
            .map(|version| version >= HANDLER_RUNTIME_VERSION)
            .unwrap_or(false)
    }

    /// Resolve the entry convention for one invocation.
    ///
    /// Handler precedence: the request's child handler, then the flow's
    /// default handler, then `index`.
    pub fn invocation(&self, message: &MessageInstance) -> InvocationStyle {
        if !self.uses_handler() {
            return InvocationStyle::Legacy;
        }
        let handler = message
            .child_handler()
            .or_else(|| non_blank(self.default_handler.as_deref()))
            .unwrap_or(DEFAULT_HANDLER);
        InvocationStyle::Handler(handler.to_string())
    }

    /// Structural checks done before any process is spawned.
    pub fn validate(&self, message: &MessageInstance) -> Result<(), FlowError> {
        if self.script.trim().is_empty() {
            return Err(FlowError::Configuration(format!(
                "flow '{}' has an empty script",
                self.label()
            )));
        }
        if let InvocationStyle::Handler(name) = self.invocation(message) {
            if !is_identifier(&name) {
                return Err(FlowError::Configuration(format!(
                    "handler name '{}' is not a valid identifier",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// `2.0` counts as an integer; `2.5`, negatives and non-finite values do not.
fn whole_secs(value: f64) -> Option<u64> {
    if value.is_finite() && value > 0.0 && value.fract() == 0.0 {
        Some(value.min(u64::MAX as f64) as u64)
    } else {
        None
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_loose_version(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Some(version);
    }
    let mut parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&parts.join(".")).ok()
}

/// JavaScript identifier check, ASCII only. Handler names are spliced into
/// the evaluated source, so nothing else is accepted.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a raw string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
