//! Ferrybus Core
//!
//! Core types and encoding shared by every ferrybus context.
//!
//! This crate provides:
//! - Endpoint addressing ([`Endpoint`], [`ContextKind`])
//! - Packet and control-frame types ([`Packet`], [`ChannelRequest`], [`ChannelStatus`])
//! - JSON frame encoding/decoding ([`codec`])
//! - Wire error model ([`SerializedError`], [`ErrorKind`])
//! - Identity helpers ([`Fingerprint`], [`RuntimeInstance`], [`ConnectionArgs`])

pub mod address;
pub mod codec;
pub mod connection;
pub mod error;
pub mod time;
pub mod types;
pub mod uid;

pub use address::{ContextKind, Endpoint};
pub use codec::{decode, encode};
pub use connection::ConnectionArgs;
pub use error::{Error, ErrorKind, Result, SerializedError};
pub use time::Timestamp;
pub use types::*;
pub use uid::{Fingerprint, RuntimeInstance};

/// JSON payload carried by packets
pub type Value = serde_json::Value;

/// Prefix of every connection fingerprint
pub const FINGERPRINT_PREFIX: &str = "uid::";

/// Number of base62 characters in a fingerprint or instance id
pub const UID_LENGTH: usize = 7;
