//! Journal record codec
//!
//! Records are free-form JSON objects. On the wire (and in coordination-service
//! nodes) they are stored as zlib-compressed UTF-8 JSON; this module provides
//! the encode/decode pair. The recognized record keys (`request_id`, `step`,
//! `user_id`, `host`, `payload`, ...) are interpreted by the snapshot layer,
//! not here.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a record to JSON and zlib-compress it.
pub fn encode(msg: &Value) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(msg)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and parse a record previously produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
