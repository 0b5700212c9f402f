//! Host-mediated callbacks available to flow scripts
//!
//! Scripts never talk to the host application directly. Each callback is
//! described by a [`HostCall`] and dispatched through [`HostCallbacks`] with
//! the [`HostScope`] captured when the sandbox was built, so a script cannot
//! pick the organization or facility it acts on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Environment variable holding the bearer token for the host callback API.
pub const HOST_TOKEN_ENV: &str = "FLOWRUN_HOST_TOKEN";

#[derive(Error, Debug)]
pub enum HostError {
    #[error("host callbacks are not configured")]
    Unconfigured,

    #[error("unknown host callback: {0}")]
    UnknownCallback(String),

    #[error("invalid arguments for {callback}: {reason}")]
    InvalidArguments {
        callback: &'static str,
        reason: String,
    },

    #[error("host rejected {callback} with status {status}: {body}")]
    Rejected {
        callback: &'static str,
        status: u16,
        body: String,
    },

    #[error("host request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Organization context every callback runs under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostScope {
    pub org_id: Option<String>,
    pub facility_id: Option<String>,
    pub flow_id: Option<String>,
    pub transaction_id: Option<String>,
}

/// One callback invocation requested by a script
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    GenerateForm {
        form_id: String,
        excluded_pages: Vec<Value>,
    },
    SpawnChildMessage {
        request: Value,
    },
    SpawnAsyncHandler {
        handler_name: String,
        content: Value,
    },
    SendOutbound {
        system_name: String,
        request: Value,
    },
    FindProviders {
        criteria: Value,
    },
    FindEncounters {
        criteria: Value,
    },
    GetFacility,
}

impl HostCall {
    /// Callback names as scripts see them
    pub const NAMES: [&'static str; 7] = [
        "generateForm",
        "spawnChildMessage",
        "spawnAsyncHandler",
        "sendOutbound",
        "findProviders",
        "findEncounters",
        "getFacility",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HostCall::GenerateForm { .. } => "generateForm",
            HostCall::SpawnChildMessage { .. } => "spawnChildMessage",
            HostCall::SpawnAsyncHandler { .. } => "spawnAsyncHandler",
            HostCall::SendOutbound { .. } => "sendOutbound",
            HostCall::FindProviders { .. } => "findProviders",
            HostCall::FindEncounters { .. } => "findEncounters",
            HostCall::GetFacility => "getFacility",
        }
    }

    /// Build a call from the callback name and positional arguments passed
    /// by the script.
    pub fn from_js(name: &str, args: Vec<Value>) -> Result<Self, HostError> {
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);

        let call = match name {
            "generateForm" => {
                let form_id = required_string("generateForm", "formId", next())?;
                let excluded_pages = match next() {
                    Value::Null => Vec::new(),
                    Value::Array(pages) => pages,
                    other => {
                        return Err(HostError::InvalidArguments {
                            callback: "generateForm",
                            reason: format!("excludedPages must be an array, got {}", other),
                        })
                    }
                };
                HostCall::GenerateForm {
                    form_id,
                    excluded_pages,
                }
            }
            "spawnChildMessage" => HostCall::SpawnChildMessage {
                request: required_object("spawnChildMessage", "request", next())?,
            },
            "spawnAsyncHandler" => HostCall::SpawnAsyncHandler {
                handler_name: required_string("spawnAsyncHandler", "handlerName", next())?,
                content: next(),
            },
            "sendOutbound" => HostCall::SendOutbound {
                system_name: required_string("sendOutbound", "systemName", next())?,
                request: next(),
            },
            "findProviders" => HostCall::FindProviders {
                criteria: optional_criteria(next()),
            },
            "findEncounters" => HostCall::FindEncounters {
                criteria: optional_criteria(next()),
            },
            "getFacility" => HostCall::GetFacility,
            other => return Err(HostError::UnknownCallback(other.to_string())),
        };
        Ok(call)
    }

    /// Named arguments, as sent to the host.
    pub fn arguments(&self) -> Value {
        match self {
            HostCall::GenerateForm {
                form_id,
                excluded_pages,
            } => json!({ "formId": form_id, "excludedPages": excluded_pages }),
            HostCall::SpawnChildMessage { request } => json!({ "request": request }),
            HostCall::SpawnAsyncHandler {
                handler_name,
                content,
            } => json!({ "handlerName": handler_name, "content": content }),
            HostCall::SendOutbound {
                system_name,
                request,
            } => json!({ "systemName": system_name, "request": request }),
            HostCall::FindProviders { criteria } | HostCall::FindEncounters { criteria } => {
                json!({ "criteria": criteria })
            }
            HostCall::GetFacility => json!({}),
        }
    }
}

fn required_string(callback: &'static str, field: &str, value: Value) -> Result<String, HostError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        other => Err(HostError::InvalidArguments {
            callback,
            reason: format!("{} must be a non-empty string, got {}", field, other),
        }),
    }
}

fn required_object(callback: &'static str, field: &str, value: Value) -> Result<Value, HostError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(HostError::InvalidArguments {
            callback,
            reason: format!("{} must be an object", field),
        })
    }
}

fn optional_criteria(value: Value) -> Value {
    if value.is_null() {
        json!({})
    } else {
        value
    }
}

/// Dispatches script callbacks to the host application
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    async fn call(&self, scope: &HostScope, call: HostCall) -> Result<Value, HostError>;
}

/// Rejects every callback. Used when no host API is configured.
pub struct UnconfiguredHost;

#[async_trait]
impl HostCallbacks for UnconfiguredHost {
    async fn call(&self, _scope: &HostScope, call: HostCall) -> Result<Value, HostError> {
        tracing::debug!(callback = call.name(), "Host callback without a configured host");
        Err(HostError::Unconfigured)
    }
}

/// Forwards callbacks as `POST {base_url}/flow-callbacks/{name}`
#[derive(Clone)]
pub struct HttpHostCallbacks {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpHostCallbacks {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    /// Token taken from `FLOWRUN_HOST_TOKEN`.
    pub fn from_env(base_url: impl Into<String>) -> Self {
        let token = std::env::var(HOST_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        Self::new(base_url, token)
    }

    pub fn endpoint(&self, call: &HostCall) -> String {
        format!("{}/flow-callbacks/{}", self.base_url, call.name())
    }
}

#[async_trait]
impl HostCallbacks for HttpHostCallbacks {
    async fn call(&self, scope: &HostScope, call: HostCall) -> Result<Value, HostError> {
        let url = self.endpoint(&call);
        tracing::debug!(url = %url, org_id = ?scope.org_id, "Forwarding host callback");

        let mut request = self.client.post(&url).json(&json!({
            "scope": scope,
            "arguments": call.arguments(),
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::Rejected {
                callback: call.name(),
                status: status.as_u16(),
                body,
            });
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json::<Value>().await?)
    }
}
