//! Error types for the HTTP transport layer.

use agent402::encoding::JsonHeaderError;

/// Errors that can occur during header encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding failed.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<JsonHeaderError> for HttpError {
    fn from(value: JsonHeaderError) -> Self {
        match value {
            JsonHeaderError::Base64(e) => Self::Base64(e),
            JsonHeaderError::Json(e) => Self::Json(e),
        }
    }
}
