//! Frames exchanged between the controller and a worker process
//!
//! Each frame is one JSON object on one line. The controller writes a single
//! [`WorkerRequest`] to the worker's stdin; the worker writes a single
//! [`WorkerReply`] to its stdout. Nothing else is ever written to stdout.

use crate::codec::{compress_json, decompress_json, CodecError};
use crate::flow::FlowDefinition;
use crate::message::MessageInstance;
use crate::settings::WorkerSettings;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Controller -> worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    #[serde(rename = "RUN")]
    Run(RunRequest),
}

/// "Execute this"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub flow: FlowDefinition,
    pub message_instance_compressed: String,
    pub config_parameters_compressed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl RunRequest {
    pub fn new(
        flow: FlowDefinition,
        message: &MessageInstance,
        settings: &WorkerSettings,
        transaction_id: Option<String>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            flow,
            message_instance_compressed: compress_json(message)?,
            config_parameters_compressed: compress_json(settings)?,
            transaction_id,
        })
    }

    pub fn message_instance(&self) -> Result<MessageInstance, CodecError> {
        decompress_json(&self.message_instance_compressed)
    }

    pub fn settings(&self) -> Result<WorkerSettings, CodecError> {
        decompress_json(&self.config_parameters_compressed)
    }
}

/// Worker -> controller, the terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerReply {
    #[serde(rename = "RUN_SUCCESS")]
    RunSuccess {
        result: Value,
        #[serde(rename = "durationMs", default)]
        duration_ms: u64,
    },
    #[serde(rename = "RUN_FAILURE")]
    RunFailure { error: ScriptError },
}

impl WorkerReply {
    pub fn success(result: Value, duration_ms: u64) -> Self {
        WorkerReply::RunSuccess {
            result,
            duration_ms,
        }
    }

    pub fn failure(error: ScriptError) -> Self {
        WorkerReply::RunFailure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerReply::RunSuccess { .. })
    }
}

/// Which part of the worker produced a failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Script code threw or called `fail`.
    #[default]
    Script,
    /// The worker's own execution budget ran out.
    Timeout,
    /// The request could not be decoded.
    Protocol,
}

/// Failure payload as reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Partial result the script attached to its error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub kind: FailureKind,
}

impl ScriptError {
    pub fn script(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            result: None,
            kind: FailureKind::Script,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            ..Self::script(message)
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            ..Self::script(message)
        }
    }

    /// Build from the object a script passed to `fail` (or threw). Accepts
    /// `{ message, stack, result }`; anything else is stringified.
    pub fn from_js(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let message = match map.remove("message") {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => "flow failed".to_string(),
                    Some(other) => other.to_string(),
                };
                let stack = match map.remove("stack") {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                let result = map.remove("result").filter(|r| !r.is_null());
                Self {
                    message,
                    stack,
                    result,
                    kind: FailureKind::Script,
                }
            }
            Value::String(s) => Self::script(s),
            Value::Null => Self::script("flow failed"),
            other => Self::script(other.to_string()),
        }
    }
}

/// Serialize a frame, newline included.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a frame.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_request_wire_shape() {
        let flow = FlowDefinition::new("context.succeed(1)");
        let message = MessageInstance::new(json!({ "value": 42 }));
        let request = RunRequest::new(
            flow,
            &message,
            &WorkerSettings::default(),
            Some("txn-1".into()),
        )
        .unwrap();

        let line = encode_frame(&WorkerRequest::Run(request)).unwrap();
        assert!(line.ends_with('\n'));
        let raw: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(raw["type"], "RUN");
        assert_eq!(raw["transactionId"], "txn-1");
        assert!(raw["messageInstanceCompressed"].is_string());
        assert!(raw["configParametersCompressed"].is_string());

        let WorkerRequest::Run(decoded) = decode_frame::<WorkerRequest>(&line).unwrap();
        assert_eq!(decoded.message_instance().unwrap(), message);
    }

    #[test]
    fn test_reply_tags() {
        let ok = encode_frame(&WorkerReply::success(json!({ "echo": 42 }), 7)).unwrap();
        let raw: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(raw["type"], "RUN_SUCCESS");
        assert_eq!(raw["durationMs"], 7);

        let failure: WorkerReply = decode_frame(
            r#"{"type":"RUN_FAILURE","error":{"message":"boom","stack":"Error: boom"}}"#,
        )
        .unwrap();
        match failure {
            WorkerReply::RunFailure { error } => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.kind, FailureKind::Script);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_script_error_from_js_values() {
        let err = ScriptError::from_js(json!({
            "message": "partial",
            "stack": "Error: partial\n    at index",
            "result": { "done": 2 }
        }));
        assert_eq!(err.message, "partial");
        assert_eq!(err.result, Some(json!({ "done": 2 })));

        assert_eq!(ScriptError::from_js(json!("plain")).message, "plain");
        assert_eq!(ScriptError::from_js(json!(17)).message, "17");
        assert_eq!(ScriptError::from_js(json!({})).message, "flow failed");
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        assert!(decode_frame::<WorkerReply>(r#"{"type":"RUN_PROGRESS"}"#).is_err());
        assert!(decode_frame::<WorkerReply>("console noise").is_err());
    }
}
