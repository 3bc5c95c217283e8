// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! # Broker-mediated RPC node
//!
//! `mesh_rpc` is the client-side node of a broker-routed RPC mesh. A node
//! registers itself with a master broker, advertises the set of message
//! names it can serve, and issues asynchronous calls to services hosted on
//! other nodes. Replies are delivered by correlation id rather than by
//! blocking, so a node never stalls waiting for a remote peer.
//!
//! ## Overview
//!
//! A [RpcNode] owns three pieces of bookkeeping:
//!
//! 1. A broker directory — this node's view of the mesh topology (the
//!    service-name to node-id map plus the known slave brokers), replaced
//!    wholesale from every registration response.
//! 2. A connection set — one live connection to the master broker and zero
//!    or more to slave brokers, each tagged with the remote broker's id.
//! 3. Handler registries — pending one-shot reply callbacks keyed by
//!    correlation id, and persistent interface handlers keyed by message
//!    name.
//!
//! All of that state is mutated on a single-consumer task queue
//! ([executor::TaskQueue]): transport tasks never touch node state directly,
//! they post jobs onto the queue and return. This keeps the node free of
//! locks without giving up multi-connection I/O.
//!
//! Connection breaks are self-healing. A broken connection is evicted from
//! the connection set and a delayed reconnect check is armed; the check
//! repairs the master connection, walks the directory for missing slave
//! connections, and re-arms itself.
//!
//! ## Getting started
//!
//! ```no_run
//! use mesh_rpc::{NodeConfig, RpcNode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let node = RpcNode::new(NodeConfig {
//!         service_name: Some("echo".to_string()),
//!         ..NodeConfig::default()
//!     });
//!
//!     // interfaces registered before `open` ride along on the first
//!     // advertisement to the broker
//!     node.register_interface("echo.ping", |call| {
//!         let body = call.body.clone();
//!         call.reply(body);
//!         Ok(())
//!     });
//!
//!     let node_id = node.open("127.0.0.1:10241").await.expect("broker unreachable");
//!     println!("registered as node {}", node_id);
//!
//!     node.call("other", "other.ping", &b"hi"[..], |reply| {
//!         println!("reply: {:?}", reply);
//!         Ok(())
//!     });
//! }
//! ```

#![warn(unused_imports)]
#![warn(unsafe_code)]
#![warn(missing_docs)]

pub mod executor;
pub mod net;
pub mod node;
pub mod protocol;
pub mod registry;

/// Nodes and brokers are represented by an integer id, assigned by the
/// master broker at registration time
pub type NodeId = u64;

/// Token linking an outbound call to its eventual reply
pub type CorrelationId = u64;

/// The reserved broker id of the master broker. A node whose bound broker id
/// is this value routes its calls over the master connection directly.
pub const MASTER_BROKER_ID: NodeId = 0;

/// The error type handlers may surface at the dispatch boundary. Failures
/// are logged there and never propagate past it.
pub type HandlerErr = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The result type of interface handlers and reply callbacks
pub type HandlerResult = Result<(), HandlerErr>;

// ============== Re-exports ============== //
pub use net::{Connection, ConnectionId, TransportEvents};
pub use node::{
    InboundCall, MemoryRouter, NodeConfig, OpenError, RegistrationStatus, RpcNode,
};
pub use protocol::{
    BridgeRouteMessage, Command, Frame, InterfaceAdvertisement, RegisterRequest,
    RegisterResponse, RouteMessage, SlaveRegister,
};
pub use registry::CallError;
