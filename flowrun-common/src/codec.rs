//! Payload codec for the worker boundary
//!
//! Payloads are serialized to JSON, deflated (zlib framing) and carried as
//! base64 text inside the line-oriented frames of [`crate::protocol`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on an inflated payload.
pub const MAX_INFLATED_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload could not be inflated: {0}")]
    Inflate(#[source] std::io::Error),

    #[error("payload could not be deflated: {0}")]
    Deflate(#[source] std::io::Error),

    #[error("payload exceeds {MAX_INFLATED_BYTES} bytes once inflated")]
    TooLarge,

    #[error("payload is not valid UTF-8 JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deflate raw bytes.
pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(CodecError::Deflate)?;
    encoder.finish().map_err(CodecError::Deflate)
}

/// Inflate bytes produced by [`deflate`].
pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(bytes).take(MAX_INFLATED_BYTES + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(CodecError::Inflate)?;
    if out.len() as u64 > MAX_INFLATED_BYTES {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

/// Serialize, deflate and base64-encode a value.
pub fn compress_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    let packed = deflate(&json)?;
    tracing::trace!(
        raw_bytes = json.len(),
        packed_bytes = packed.len(),
        "compressed payload"
    );
    Ok(STANDARD.encode(packed))
}

/// Reverse of [`compress_json`].
pub fn decompress_json<T: DeserializeOwned>(encoded: &str) -> Result<T, CodecError> {
    let packed = STANDARD.decode(encoded.trim())?;
    let json = inflate(&packed)?;
    Ok(serde_json::from_slice(&json)?)
}
