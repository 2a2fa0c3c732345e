//! Frame encoding
//!
//! Every frame crosses a physical link as a single JSON document.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Encode any wire frame into bytes
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes> {
    serde_json::to_vec(frame)
        .map(Bytes::from)
        .map_err(Error::encode)
}

/// Decode a wire frame from bytes
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(Error::decode)
}
