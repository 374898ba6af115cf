//! Base64 helpers for payment headers.
//!
//! Every payment header carries standard-alphabet base64 of a JSON document.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;

/// Bytes holding base64 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    /// Decodes the base64 text to raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(self.0.trim_ascii())
    }

    /// Encodes raw bytes into base64 text.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Self {
        let encoded = b64.encode(input.as_ref());
        Self(encoded.into_bytes())
    }

    /// Serializes `value` to JSON and base64-encodes it.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` fails to serialize.
    pub fn encode_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self::encode)
    }

    /// Base64-decodes and parses the JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`JsonHeaderError`] if either step fails.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, JsonHeaderError> {
        let raw = self.decode()?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Failure decoding a base64 JSON header.
#[derive(Debug, thiserror::Error)]
pub enum JsonHeaderError {
    /// Not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Valid base64, invalid JSON.
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AsRef<[u8]> for Base64Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Base64Bytes {
    fn from(slice: &[u8]) -> Self {
        Self(slice.to_vec())
    }
}

impl From<&str> for Base64Bytes {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Display for Base64Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
