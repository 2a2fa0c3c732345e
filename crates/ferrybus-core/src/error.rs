//! Error types for ferrybus

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Destination text does not match `kind[@tabId[.frameId]]`
    #[error("invalid endpoint: {0}")]
    AddressParse(String),

    /// JSON encoding error
    #[error("encode error: {0}")]
    EncodeError(String),

    /// JSON decoding error
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Connection args missing required keys
    #[error("invalid connection args: {0}")]
    InvalidConnectionArgs(String),
}

impl Error {
    pub fn encode(e: serde_json::Error) -> Self {
        Error::EncodeError(e.to_string())
    }

    pub fn decode(e: serde_json::Error) -> Self {
        Error::DecodeError(e.to_string())
    }
}

/// Closed set of error kinds that can travel on a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A handler returned an error
    Handler,
    /// No handler anywhere along the relay chain
    NoHandler,
    /// The destination's connection vanished
    Terminated,
    /// The transaction was ended before a reply arrived
    TransactionEnded,
    /// Anything this build does not know how to reconstruct
    #[serde(other)]
    Unknown,
}

/// Error as carried in a reply packet's `error` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl SerializedError {
    pub fn new(kind: ErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_deserializes() {
        let json = r#"{"kind":"quota-exceeded","name":"QuotaError","message":"full"}"#;
        let err: SerializedError = serde_json::from_str(json).unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.name, "QuotaError");
        assert!(err.fields.is_empty());
    }

    #[test]
    fn test_fields_survive_json() {
        let err = SerializedError::new(ErrorKind::Handler, "RangeError", "too big")
            .with_field("limit", 10);
        let json = serde_json::to_string(&err).unwrap();
        let back: SerializedError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.field("limit"), Some(&serde_json::json!(10)));
        assert_eq!(back.to_string(), "RangeError: too big");
    }
}
