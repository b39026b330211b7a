//! Compression codec for snapshots and backups
//!
//! Snapshots and backups are serialized to JSON, compressed with a `Codec`,
//! and stored as base64 text inside the JSON state store.

use crate::error::{RelayError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// General-purpose byte compressor
pub trait Codec: Send + Sync {
    fn compress(&self, input: &[u8]) -> Result<Bytes>;

    fn decompress(&self, input: &[u8]) -> Result<Bytes>;

    fn name(&self) -> &str;
}

/// Gzip codec backed by flate2
#[derive(Debug, Clone)]
pub struct GzipCodec {
    level: Compression,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Codec for GzipCodec {
    fn compress(&self, input: &[u8]) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder
            .write_all(input)
            .map_err(|e| RelayError::Codec(format!("gzip write failed: {}", e)))?;
        let out = encoder
            .finish()
            .map_err(|e| RelayError::Codec(format!("gzip finish failed: {}", e)))?;
        Ok(Bytes::from(out))
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes> {
        let mut decoder = GzDecoder::new(input);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| RelayError::Codec(format!("gzip read failed: {}", e)))?;
        Ok(Bytes::from(out))
    }

    fn name(&self) -> &str {
        "gzip"
    }
}

/// Serialize, compress, and base64-encode a value
pub fn pack<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    let compressed = codec.compress(&json)?;
    Ok(BASE64.encode(&compressed))
}

/// Inverse of [`pack`]
pub fn unpack<T: DeserializeOwned>(codec: &dyn Codec, data: &str) -> Result<T> {
    let compressed = BASE64
        .decode(data)
        .map_err(|e| RelayError::Codec(format!("invalid base64: {}", e)))?;
    let json = codec.decompress(&compressed)?;
    Ok(serde_json::from_slice(&json)?)
}
