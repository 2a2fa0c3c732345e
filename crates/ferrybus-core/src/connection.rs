//! Connection identity sent by a leaf when it opens a channel to the hub

use serde::{Deserialize, Serialize};

use crate::{Endpoint, Error, Fingerprint, Result};

/// Names a leaf's channel: which endpoint it serves and which activation it is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionArgs {
    pub endpoint_name: String,
    pub fingerprint: Fingerprint,
}

impl ConnectionArgs {
    pub fn new(endpoint_name: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            fingerprint,
        }
    }

    /// Encode as the JSON channel name
    pub fn encode(&self) -> Result<String> {
        if self.endpoint_name.is_empty() {
            return Err(Error::InvalidConnectionArgs("empty endpoint name".into()));
        }
        serde_json::to_string(self).map_err(Error::encode)
    }

    /// Decode a channel name; malformed input yields `None`
    pub fn decode(encoded: &str) -> Option<Self> {
        serde_json::from_str::<Self>(encoded)
            .ok()
            .filter(|args| !args.endpoint_name.is_empty())
    }

    /// Endpoint this channel serves
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint_name)
    }
}
