//! Shared types for flowrun
//!
//! The flow and message model, the worker wire protocol, the payload codec
//! and the error taxonomy used on both sides of the process boundary.

pub mod codec;
pub mod error;
pub mod flow;
pub mod message;
pub mod protocol;
pub mod settings;

pub use codec::{compress_json, decompress_json, CodecError};
pub use error::{ErrorKind, FlowError, FlowResult};
pub use flow::{
    FlowDefinition, InvocationStyle, ScriptLanguage, DEFAULT_HANDLER, DEFAULT_TIMEOUT_SECS,
    MAX_TIMEOUT_SECS,
};
pub use message::{MessageInstance, MessageRequest};
pub use protocol::{
    decode_frame, encode_frame, FailureKind, RunRequest, ScriptError, WorkerReply, WorkerRequest,
};
pub use settings::{Environment, WorkerSettings};
