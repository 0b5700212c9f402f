//! Message instances handed to flows

use crate::error::FlowError;
use crate::flow::json_type_name;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of inbound data processed by a flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInstance {
    #[serde(default)]
    pub guid: Option<String>,

    #[serde(default)]
    pub parent_guid: Option<String>,

    #[serde(default)]
    pub stream_type: Option<String>,

    /// Payload. Either structured JSON or a string that may hold
    /// pre-serialized JSON.
    #[serde(default)]
    pub content: Value,

    /// Request linkage when this message was spawned by another invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<MessageRequest>,

    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Parent-request linkage carried by spawned messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub parent_request_id: Option<String>,

    /// Handler requested by the parent invocation.
    #[serde(default)]
    pub child_handler: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageInstance {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    /// Parse an untyped message, refusing anything that is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        if !value.is_object() {
            return Err(FlowError::Configuration(format!(
                "message instance must be a structured object, got {}",
                json_type_name(&value)
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| FlowError::Configuration(format!("malformed message instance: {}", e)))
    }

    /// Content as the script sees it. Strings holding a JSON object or array
    /// are parsed; any other string is passed through untouched.
    pub fn content_value(&self) -> Value {
        match &self.content {
            Value::String(raw) => {
                let trimmed = raw.trim_start();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    serde_json::from_str(raw).unwrap_or_else(|_| self.content.clone())
                } else {
                    self.content.clone()
                }
            }
            other => other.clone(),
        }
    }

    /// Child handler named by the request, if any.
    pub fn child_handler(&self) -> Option<&str> {
        self.request
            .as_ref()
            .and_then(|request| request.child_handler.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
