//! Packet and control-frame definitions

use serde::{Deserialize, Serialize};

use crate::error::SerializedError;
use crate::time::{self, Timestamp};
use crate::uid::{self, is_hub_stamp, Fingerprint};
use crate::{Endpoint, Value};

/// Packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Reply,
    Broadcast,
}

/// The envelope every message travels in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Message name (requests) or event id (broadcasts)
    pub id: String,
    pub transaction_id: String,
    pub message_type: MessageType,
    pub origin: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Endpoint>,
    pub timestamp: Timestamp,
    /// Append-only `kind::instance` stamps
    #[serde(default)]
    pub hops: Vec<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl Packet {
    /// New request with a fresh transaction id and no hops
    pub fn request(id: impl Into<String>, data: Value, origin: Endpoint, destination: Endpoint) -> Self {
        Self {
            id: id.into(),
            transaction_id: uid::transaction_id(),
            message_type: MessageType::Request,
            origin,
            destination: Some(destination),
            timestamp: time::now(),
            hops: Vec::new(),
            data,
            error: None,
        }
    }

    /// New broadcast event, no destination
    pub fn broadcast(id: impl Into<String>, data: Value, origin: Endpoint) -> Self {
        Self {
            id: id.into(),
            transaction_id: uid::transaction_id(),
            message_type: MessageType::Broadcast,
            origin,
            destination: None,
            timestamp: time::now(),
            hops: Vec::new(),
            data,
            error: None,
        }
    }

    /// Reply to this request: same transaction, endpoints swapped, hops carried over
    pub fn reply(&self, responder: Endpoint, outcome: Result<Value, SerializedError>) -> Self {
        let (data, error) = match outcome {
            Ok(data) => (data, None),
            Err(err) => (Value::Null, Some(err)),
        };
        Self {
            id: self.id.clone(),
            transaction_id: self.transaction_id.clone(),
            message_type: MessageType::Reply,
            origin: responder,
            destination: Some(self.origin),
            timestamp: time::now(),
            hops: self.hops.clone(),
            data,
            error,
        }
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    pub fn is_reply(&self) -> bool {
        self.message_type == MessageType::Reply
    }

    pub fn is_broadcast(&self) -> bool {
        self.message_type == MessageType::Broadcast
    }

    /// Append a hop stamp unless it is already the most recent entry.
    ///
    /// Returns `true` if the stamp was appended.
    pub fn push_hop(&mut self, stamp: &str) -> bool {
        if self.hops.last().map(String::as_str) == Some(stamp) {
            return false;
        }
        self.hops.push(stamp.to_string());
        true
    }

    pub fn has_visited(&self, stamp: &str) -> bool {
        self.hops.iter().any(|hop| hop == stamp)
    }

    /// True once any hub instance has relayed this packet
    pub fn relayed_via_hub(&self) -> bool {
        self.hops.iter().any(|hop| is_hub_stamp(hop))
    }
}

/// What a handler or listener sees of an inbound packet
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub id: String,
    pub data: Value,
    pub sender: Endpoint,
    pub timestamp: Timestamp,
}

impl From<&Packet> for IncomingMessage {
    fn from(packet: &Packet) -> Self {
        Self {
            id: packet.id.clone(),
            data: packet.data.clone(),
            sender: packet.origin,
            timestamp: packet.timestamp,
        }
    }
}

/// Where a receipted request came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptOrigin {
    pub endpoint_id: String,
    pub fingerprint: Fingerprint,
}

/// Proof that a request reached its destination connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message: Packet,
    /// Fingerprint of the destination connection
    pub to: Fingerprint,
    pub from: ReceiptOrigin,
}

/// Leaf → hub control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelRequest {
    #[serde(rename_all = "camelCase")]
    Sync {
        pending_responses: Vec<DeliveryReceipt>,
        pending_deliveries: Vec<String>,
    },
    Deliver { message: Packet },
}

/// Hub → leaf control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChannelStatus {
    #[serde(rename_all = "camelCase")]
    Undeliverable {
        message: Packet,
        resolved_destination: String,
    },
    #[serde(rename_all = "camelCase")]
    Deliverable { deliverable_to: String },
    Delivered { receipt: DeliveryReceipt },
    Incoming { message: Packet },
    Terminated { fingerprint: Fingerprint },
}

/// Frames exchanged between a content script and its page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeFrame {
    Packet { packet: Packet },
    /// The named transaction's destination vanished
    #[serde(rename_all = "camelCase")]
    EndpointWontRespond { transaction_id: String },
}
