// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The broker wire protocol: command codes, envelope payloads and the
//! envelope codec.
//!
//! Every frame on a broker connection is a command code plus an encoded
//! envelope. The node only ever *receives* two commands (registration
//! responses and routed messages); everything else is outbound. A routed
//! message carries both calls and replies — an empty `dest_service` marks
//! the envelope as a reply completing a pending call, there is no separate
//! envelope type.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, NodeId};

/// Command codes tagging each frame on a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// [RegisterRequest], sent on every fresh broker connection
    RegisterRequest = 1,
    /// [RegisterResponse], the broker's answer to a registration request
    RegisterResponse = 2,
    /// [InterfaceAdvertisement], the node's locally served message names
    InterfaceAdvertisement = 3,
    /// [SlaveRegister], affiliation with a non-master broker
    SlaveRegister = 4,
    /// [RouteMessage], a routed call or reply
    RouteMessage = 5,
    /// [BridgeRouteMessage], a call addressed to a remote broker group
    BridgeRoute = 6,
}

impl Command {
    /// Map a raw frame command code back to a known [Command]. Unknown codes
    /// yield [None] and the frame is dropped at the dispatch boundary.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::RegisterRequest),
            2 => Some(Self::RegisterResponse),
            3 => Some(Self::InterfaceAdvertisement),
            4 => Some(Self::SlaveRegister),
            5 => Some(Self::RouteMessage),
            6 => Some(Self::BridgeRoute),
            _ => None,
        }
    }
}

/// A single framed unit on a broker connection: the raw command code plus
/// the encoded envelope body
#[derive(Debug, Clone)]
pub struct Frame {
    /// The command code identifying the envelope type
    pub command: u16,
    /// The encoded envelope
    pub body: Bytes,
}

/// Registration request, carried on every broker connection the node opens.
/// A zero `node_id` means the node has not been assigned an identity yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The service name this node advertises
    pub service_name: String,
    /// The node's current id (0 when unregistered)
    pub node_id: NodeId,
}

/// The broker's answer to a [RegisterRequest].
///
/// `register_flag` semantics: negative means the registration was rejected
/// (service name collision), `1` means success and the node should adopt the
/// carried identity, any other value is an informational topology sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Rejected (< 0), success (1) or topology sync (anything else)
    pub register_flag: i32,
    /// The node id assigned to this node
    pub node_id: NodeId,
    /// The broker this node is affiliated with for reply routing
    /// ([crate::MASTER_BROKER_ID] when bound to the master directly)
    pub bound_broker_id: NodeId,
    /// The full service-name to hosting-node-id map
    pub service_to_node: HashMap<String, NodeId>,
    /// The known slave brokers, host address to broker id
    pub slave_brokers: HashMap<String, NodeId>,
}

/// Advertises the set of message names this node serves locally. Resent
/// every time a fresh master connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAdvertisement {
    /// Broker id colocated in this process, if any (in-memory delivery
    /// shortcut hint; 0 when there is none)
    pub binder_broker_id: NodeId,
    /// The advertising node's service name
    pub service_name: String,
    /// The message names the node can serve
    pub message_names: BTreeSet<String>,
}

/// Sent when affiliating with a non-master broker, after the common
/// [RegisterRequest]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRegister {
    /// The node's assigned id
    pub node_id: NodeId,
}

/// A routed application message, carrying both calls and replies.
///
/// A non-empty `dest_service` marks an inbound call for the named interface;
/// an empty `dest_service` marks a reply completing the pending call
/// identified by `correlation_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMessage {
    /// Destination service name (empty for replies)
    pub dest_service: String,
    /// Destination message name (empty for replies)
    pub dest_message: String,
    /// Destination node id (0 when the service was unresolved locally; the
    /// broker rejects such messages downstream)
    pub dest_node_id: NodeId,
    /// The sending node's id
    pub from_node_id: NodeId,
    /// Token correlating the reply back to the caller's pending entry
    pub correlation_id: CorrelationId,
    /// Bridge path the reply must be steered back through (0 for none)
    pub bridge_route_id: u64,
    /// Opaque message body
    pub body: Bytes,
}

impl RouteMessage {
    /// Whether this envelope is a reply completing a pending call (empty
    /// destination service) rather than an inbound call
    pub fn is_reply(&self) -> bool {
        self.dest_service.is_empty()
    }
}

/// A call addressed to a remote broker group by name, routed through the
/// local master broker onto the group's bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRouteMessage {
    /// The destination broker group
    pub dest_broker_group: String,
    /// Destination service name within the group
    pub service_name: String,
    /// Destination message name
    pub message_name: String,
    /// The sending node's id
    pub from_node_id: NodeId,
    /// Correlation token (0 for fire-and-forget calls)
    pub correlation_id: CorrelationId,
    /// Opaque message body
    pub body: Bytes,
}

/// An envelope failed to encode or decode
#[derive(Debug)]
pub struct EnvelopeError(bincode::Error);

impl Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope codec error: {}", self.0)
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

impl From<bincode::Error> for EnvelopeError {
    fn from(value: bincode::Error) -> Self {
        Self(value)
    }
}

/// Encode an envelope payload for transmission
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, EnvelopeError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode an envelope payload received off the wire
pub fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, EnvelopeError> {
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_response_codec() {
        let mut response = RegisterResponse {
            register_flag: 1,
            node_id: 7,
            bound_broker_id: 0,
            ..Default::default()
        };
        response.service_to_node.insert("A".to_string(), 7);
        response.service_to_node.insert("B".to_string(), 9);
        response.slave_brokers.insert("10.0.0.2:10242".to_string(), 3);

        let body = encode(&response).expect("Failed to encode response");
        let decoded: RegisterResponse = decode(&body).expect("Failed to decode response");
        assert_eq!(response, decoded);
    }

    #[test]
    fn reply_convention_is_empty_dest_service() {
        let call = RouteMessage {
            dest_service: "B".to_string(),
            dest_message: "ping".to_string(),
            ..Default::default()
        };
        assert!(!call.is_reply());

        let reply = RouteMessage {
            correlation_id: 42,
            body: Bytes::from_static(b"ok"),
            ..Default::default()
        };
        assert!(reply.is_reply());
    }

    #[test]
    fn unknown_command_codes_are_rejected() {
        assert_eq!(Command::from_u16(5), Some(Command::RouteMessage));
        assert_eq!(Command::from_u16(999), None);
        assert_eq!(Command::from_u16(0), None);
    }
}
