//! Router error types

use ferrybus_core::{ErrorKind, SerializedError, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

/// Failure raised by a message handler or broadcast listener
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{name}: {message}")]
pub struct HandlerError {
    pub name: String,
    pub message: String,
    pub fields: serde_json::Map<String, Value>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Plain error with the generic `Error` name
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn to_wire(&self) -> SerializedError {
        SerializedError {
            kind: ErrorKind::Handler,
            name: self.name.clone(),
            message: self.message.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::msg(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::new("SerializationError", e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("core protocol error: {0}")]
    Core(#[from] ferrybus_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] ferrybus_transport::TransportError),

    #[error("no handler registered for '{message_id}' at {destination}")]
    NoHandler {
        message_id: String,
        destination: String,
    },

    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// Error of a kind this build cannot reconstruct
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },

    #[error("destination of transaction {0} terminated")]
    Terminated(String),

    #[error("transaction {0} was ended before it could complete")]
    TransactionEnded(String),

    #[error("transaction {0} was evicted from a full delivery backlog")]
    BacklogOverflow(String),

    #[error("error(s) occurred while handling broadcast event '{event_id}': {}", join_errors(.errors))]
    AggregateBroadcast {
        event_id: String,
        errors: Vec<HandlerError>,
    },

    #[error("reply channel dropped")]
    ReplyDropped,
}

fn join_errors(errors: &[HandlerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl RouterError {
    /// Serialize for a reply packet's `error` field
    pub fn to_wire(&self) -> SerializedError {
        match self {
            RouterError::Handler(e) => e.to_wire(),
            RouterError::NoHandler {
                message_id,
                destination,
            } => SerializedError::new(ErrorKind::NoHandler, "NoHandlerError", self.to_string())
                .with_field("messageId", message_id.as_str())
                .with_field("destination", destination.as_str()),
            RouterError::Terminated(id) => {
                SerializedError::new(ErrorKind::Terminated, "TerminatedError", self.to_string())
                    .with_field("transactionId", id.as_str())
            }
            RouterError::TransactionEnded(id) => SerializedError::new(
                ErrorKind::TransactionEnded,
                "TransactionEndedError",
                self.to_string(),
            )
            .with_field("transactionId", id.as_str()),
            RouterError::Remote { name, message } => {
                SerializedError::new(ErrorKind::Unknown, name.as_str(), message.as_str())
            }
            other => SerializedError::new(ErrorKind::Unknown, "Error", other.to_string()),
        }
    }

    /// Rebuild an error that arrived on a reply
    pub fn from_wire(err: SerializedError) -> Self {
        let text = |key: &str| {
            err.field(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        match err.kind {
            ErrorKind::Handler => RouterError::Handler(HandlerError {
                name: err.name,
                message: err.message,
                fields: err.fields,
            }),
            ErrorKind::NoHandler => RouterError::NoHandler {
                message_id: text("messageId"),
                destination: text("destination"),
            },
            ErrorKind::Terminated => RouterError::Terminated(text("transactionId")),
            ErrorKind::TransactionEnded => RouterError::TransactionEnded(text("transactionId")),
            ErrorKind::Unknown => RouterError::Remote {
                name: err.name,
                message: err.message,
            },
        }
    }
}
