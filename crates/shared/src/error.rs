use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the REST backend, e.g. `{"message": "Not authorized"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Parses a response body, falling back to the raw text when it is not the
    /// backend's JSON error shape.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<ApiError>(body) {
            Ok(parsed) if !parsed.message.is_empty() => parsed,
            _ => Self::new(body.trim()),
        }
    }
}
