// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The RPC node: registration with the master broker, interface serving and
//! asynchronous calls.
//!
//! [RpcNode] is a cheap-to-clone handle. The real state lives on the node's
//! drain task (see [crate::executor]); every operation on the handle posts a
//! job there and returns, except [RpcNode::open] and [RpcNode::is_exist]
//! which await an answer. A node stays alive until process teardown — there
//! is no explicit shutdown.

mod directory;
mod state;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use crate::executor::TaskQueue;
use crate::net::{self, ConnectionId, TransportEvents};
use crate::protocol::Frame;
use crate::registry::{CallError, ReplyCallback};
use crate::{HandlerResult, NodeId, MASTER_BROKER_ID};

use state::NodeState;

/// A persistent handler serving one message name of this node's interface
pub type CallHandler = Box<dyn Fn(InboundCall) -> HandlerResult + Send + 'static>;

/// Hook for in-process broker colocation.
///
/// When the broker this node is bound to lives in the same process, routed
/// messages can skip the socket entirely: [MemoryRouter::route_to_broker]
/// accepts the envelope for direct delivery, or hands it back for normal
/// socket transmission when the broker id is not colocated.
pub trait MemoryRouter: Send + Sync + 'static {
    /// The broker id hosted in this process, if any. Advertised to the
    /// master so peers can address this process directly.
    fn colocated_broker(&self) -> Option<NodeId>;

    /// Deliver a routed message in-process. Returning `Err` hands the
    /// envelope back untouched for socket transmission.
    fn route_to_broker(
        &self,
        broker_id: NodeId,
        message: crate::protocol::RouteMessage,
    ) -> Result<(), crate::protocol::RouteMessage>;
}

/// Where the node stands with the master broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// No registration response accepted yet
    Unregistered,
    /// Registered under the carried node id
    Registered(NodeId),
    /// The broker rejected the registration (service name collision)
    Rejected,
}

/// Construction-time settings for a [RpcNode]
#[derive(Clone)]
pub struct NodeConfig {
    /// The service name to register under. [None] generates a unique
    /// anonymous name, for pure-caller nodes that serve nothing.
    pub service_name: Option<String>,
    /// How long [RpcNode::open] waits for the broker to accept or reject
    /// the registration
    pub open_timeout: Duration,
    /// Delay between reconnect checks once the self-healing tick is armed
    pub reconnect_interval: Duration,
    /// Deadline for pending calls. [None] (the default) keeps callbacks
    /// waiting indefinitely, matching brokers that never drop replies.
    pub call_timeout: Option<Duration>,
    /// In-process delivery shortcut for colocated brokers
    pub router: Option<Arc<dyn MemoryRouter>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            open_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_millis(500),
            call_timeout: None,
            router: None,
        }
    }
}

/// Why [RpcNode::open] failed
#[derive(Debug)]
pub enum OpenError {
    /// The TCP connection to the master broker could not be established
    Connect(tokio::io::Error),
    /// The broker rejected the registration (service name collision)
    Rejected,
    /// No registration response arrived within the configured open timeout
    Timeout,
    /// The node's drain task is gone
    NodeStopped,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "failed to connect to the master broker: {err}"),
            Self::Rejected => write!(f, "the master broker rejected the registration"),
            Self::Timeout => write!(f, "timed out waiting for a registration response"),
            Self::NodeStopped => write!(f, "the node's task queue is stopped"),
        }
    }
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect(err) => Some(err),
            _ => None,
        }
    }
}

impl From<tokio::io::Error> for OpenError {
    fn from(value: tokio::io::Error) -> Self {
        Self::Connect(value)
    }
}

/// An inbound call delivered to an interface handler.
///
/// Carries everything a reply needs: the caller's node id, the correlation
/// id and the bridge path the reply must be steered back through. Replying
/// is optional — dropping the call without replying is the fire-and-forget
/// degradation for one-way messages.
pub struct InboundCall {
    /// The opaque message body
    pub body: Bytes,
    /// The calling node's id
    pub from_node_id: NodeId,
    /// The caller's correlation token, echoed verbatim in the reply
    pub correlation_id: u64,
    /// The bridge path for cross-group replies (0 for in-group calls)
    pub bridge_route_id: u64,
    node: RpcNode,
}

impl InboundCall {
    /// The node this call was delivered to, for issuing further calls from
    /// inside a handler
    pub fn node(&self) -> &RpcNode {
        &self.node
    }

    /// Reply to the caller with the given body
    pub fn reply(self, body: impl Into<Bytes>) {
        self.node.response(
            self.from_node_id,
            self.correlation_id,
            self.bridge_route_id,
            body,
        );
    }
}

/// Bridges transport callbacks onto the node's task queue
pub(crate) struct NodeEvents {
    pub(crate) queue: TaskQueue<NodeState>,
}

impl TransportEvents for NodeEvents {
    fn message_received(&self, connection: ConnectionId, frame: Frame) {
        if !self.queue.post(move |state| state.handle_message(connection, frame)) {
            tracing::trace!("Node task queue gone, dropping frame from connection {connection}");
        }
    }

    fn connection_closed(&self, connection: ConnectionId) {
        let _ = self
            .queue
            .post(move |state| state.handle_disconnect(connection));
    }
}

/// The client-side handle to a broker-mediated RPC node.
///
/// Cloning is cheap and every clone addresses the same node. Construction
/// spawns the drain task, so a [RpcNode] must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct RpcNode {
    pub(crate) queue: TaskQueue<NodeState>,
    pub(crate) registration: watch::Receiver<RegistrationStatus>,
    pub(crate) open_timeout: Duration,
    pub(crate) service_name: String,
    pub(crate) events: Arc<NodeEvents>,
}

impl RpcNode {
    /// Create a node and spawn its drain task. The node is inert until
    /// [RpcNode::open] connects it to a master broker.
    pub fn new(config: NodeConfig) -> Self {
        let service_name = config
            .service_name
            .clone()
            .unwrap_or_else(generated_service_name);
        let (queue, jobs) = TaskQueue::channel();
        let (registration_tx, registration_rx) = watch::channel(RegistrationStatus::Unregistered);
        let events = Arc::new(NodeEvents {
            queue: queue.clone(),
        });

        let node = Self {
            queue,
            registration: registration_rx,
            open_timeout: config.open_timeout,
            service_name: service_name.clone(),
            events,
        };
        let state = NodeState::new(node.clone(), service_name, &config, registration_tx);
        jobs.run(state);
        node
    }

    /// Connect to the master broker at `host` and register this node's
    /// service name, returning the assigned node id.
    ///
    /// The connection attempt fails fast; waiting for the broker's
    /// accept/reject decision is bounded by the configured open timeout.
    /// Interfaces registered before `open` ride along on the first
    /// advertisement.
    pub async fn open(&self, host: impl Into<String>) -> Result<NodeId, OpenError> {
        let host = host.into();
        let events: Arc<dyn TransportEvents> = self.events.clone();
        let connection = net::connect(&host, MASTER_BROKER_ID, events).await?;
        if !self
            .queue
            .post(move |state| state.install_master(host, connection))
        {
            return Err(OpenError::NodeStopped);
        }

        let mut registration = self.registration.clone();
        let wait = async move {
            loop {
                match *registration.borrow_and_update() {
                    RegistrationStatus::Registered(node_id) => return Ok(node_id),
                    RegistrationStatus::Rejected => return Err(OpenError::Rejected),
                    RegistrationStatus::Unregistered => {}
                }
                if registration.changed().await.is_err() {
                    return Err(OpenError::NodeStopped);
                }
            }
        };
        match tokio::time::timeout(self.open_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(OpenError::Timeout),
        }
    }

    /// Bind a handler for one message name of this node's interface.
    ///
    /// Binding before `open` is the common path; binding afterwards works
    /// too and re-advertises the full interface set to the broker.
    pub fn register_interface<F>(&self, message_name: impl Into<String>, handler: F)
    where
        F: Fn(InboundCall) -> HandlerResult + Send + 'static,
    {
        let message_name = message_name.into();
        let handler: CallHandler = Box::new(handler);
        if !self
            .queue
            .post(move |state| state.bind_interface(message_name, handler))
        {
            tracing::warn!("Node task queue gone, dropping interface registration");
        }
    }

    /// Call a message on a service somewhere in the mesh. The callback runs
    /// on the node's drain task when the reply arrives (or, with a call
    /// timeout configured, with [CallError::TimedOut] when it does not).
    pub fn call<F>(
        &self,
        service: impl Into<String>,
        message: impl Into<String>,
        body: impl Into<Bytes>,
        callback: F,
    ) where
        F: FnOnce(Result<Bytes, CallError>) -> HandlerResult + Send + 'static,
    {
        let (service, message, body) = (service.into(), message.into(), body.into());
        let callback: ReplyCallback = Box::new(callback);
        if !self
            .queue
            .post(move |state| state.start_call(service, message, body, callback))
        {
            tracing::warn!("Node task queue gone, dropping call");
        }
    }

    /// Call a service in another broker group, awaiting a reply through the
    /// bridge
    pub fn bridge_call<F>(
        &self,
        group: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
        body: impl Into<Bytes>,
        callback: F,
    ) where
        F: FnOnce(Result<Bytes, CallError>) -> HandlerResult + Send + 'static,
    {
        self.post_bridge(
            group.into(),
            service.into(),
            message.into(),
            body.into(),
            Some(Box::new(callback)),
        );
    }

    /// Fire-and-forget variant of [RpcNode::bridge_call]: no correlation id
    /// is allocated and no reply is expected
    pub fn bridge_cast(
        &self,
        group: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
        body: impl Into<Bytes>,
    ) {
        self.post_bridge(group.into(), service.into(), message.into(), body.into(), None);
    }

    fn post_bridge(
        &self,
        group: String,
        service: String,
        message: String,
        body: Bytes,
        callback: Option<ReplyCallback>,
    ) {
        if !self.queue.post(move |state| {
            state.start_bridge_call(group, service, message, body, callback)
        }) {
            tracing::warn!("Node task queue gone, dropping bridge call");
        }
    }

    /// Send a reply envelope to the node that issued a call. Usually
    /// reached through [InboundCall::reply]; exposed for handlers that
    /// stash the call coordinates and answer later.
    pub fn response(
        &self,
        node_id: NodeId,
        correlation_id: u64,
        bridge_route_id: u64,
        body: impl Into<Bytes>,
    ) {
        let body = body.into();
        let _ = self.queue.post(move |state| {
            state.send_response(node_id, correlation_id, bridge_route_id, body)
        });
    }

    /// Whether a service name is present in this node's current view of the
    /// mesh. Answers [false] when the node is stopped.
    pub async fn is_exist(&self, service: impl Into<String>) -> bool {
        let service = service.into();
        let (tx, rx) = oneshot::channel();
        if !self.queue.post(move |state| {
            let _ = tx.send(state.directory.contains_service(&service));
        }) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// This node's broker-assigned id, or 0 while unregistered
    pub fn node_id(&self) -> NodeId {
        match *self.registration.borrow() {
            RegistrationStatus::Registered(node_id) => node_id,
            _ => 0,
        }
    }

    /// The service name this node registers under
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The node's current standing with the master broker
    pub fn registration_status(&self) -> RegistrationStatus {
        *self.registration.borrow()
    }
}

/// Unique anonymous service name for pure-caller nodes
fn generated_service_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("rpc-node-{}-{:08x}", now, rand::random::<u32>())
}
