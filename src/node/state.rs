// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The node's single-writer state and every handler that mutates it.
//!
//! All functions here run as jobs on the node's task queue, so they can
//! freely mutate the directory, the connection set and the handler
//! registries without synchronization. The two inbound transport commands
//! (registration responses and routed messages) dispatch through a
//! command-code table; failures inside a handler are caught at
//! [NodeState::handle_message] — logged, reported as a failed dispatch and
//! never allowed to take the node down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;

use super::directory::{BrokerDirectory, ConnectionSet};
use super::{CallHandler, InboundCall, MemoryRouter, NodeConfig, RegistrationStatus, RpcNode};
use crate::net::{Connection, ConnectionId, TransportEvents};
use crate::protocol::{
    self, BridgeRouteMessage, Command, Frame, InterfaceAdvertisement, RegisterRequest,
    RegisterResponse, RouteMessage, SlaveRegister,
};
use crate::registry::{CallError, HandlerTable, PendingCalls, ReplyCallback};
use crate::{HandlerResult, NodeId, MASTER_BROKER_ID};

/// A transport-command handler, bound by command code at node construction
pub(crate) type CommandHandler = fn(&mut NodeState, ConnectionId, Bytes) -> HandlerResult;

/// Everything the node owns. Lives on the drain task; the only way in is a
/// posted job.
pub(crate) struct NodeState {
    pub(crate) node: RpcNode,
    pub(crate) service_name: String,
    pub(crate) reconnect_interval: Duration,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) router: Option<Arc<dyn MemoryRouter>>,
    pub(crate) registration: watch::Sender<RegistrationStatus>,

    /// Identity assigned by the broker; 0 while unregistered
    pub(crate) node_id: NodeId,
    /// Broker this node routes its calls through
    /// ([MASTER_BROKER_ID] = master directly)
    pub(crate) bound_broker_id: NodeId,
    /// Master broker address, recorded at `open` for reconnects
    pub(crate) master_host: Option<String>,

    pub(crate) directory: BrokerDirectory,
    pub(crate) connections: ConnectionSet,
    pub(crate) interfaces: HandlerTable<String, CallHandler>,
    pub(crate) pending: PendingCalls,
    pub(crate) commands: HandlerTable<u16, CommandHandler>,

    /// Broker ids with a connect attempt in flight, so overlapping ticks
    /// never race two attempts for the same broker
    pub(crate) connecting: HashSet<NodeId>,
    pub(crate) tick_armed: bool,
    pub(crate) sweep_armed: bool,
}

impl NodeState {
    pub(crate) fn new(
        node: RpcNode,
        service_name: String,
        config: &NodeConfig,
        registration: watch::Sender<RegistrationStatus>,
    ) -> Self {
        let mut commands: HandlerTable<u16, CommandHandler> = HandlerTable::new();
        commands.bind(
            Command::RegisterResponse as u16,
            NodeState::handle_register_response as CommandHandler,
        );
        commands.bind(
            Command::RouteMessage as u16,
            NodeState::handle_route_message as CommandHandler,
        );

        Self {
            node,
            service_name,
            reconnect_interval: config.reconnect_interval,
            call_timeout: config.call_timeout,
            router: config.router.clone(),
            registration,
            node_id: 0,
            bound_broker_id: MASTER_BROKER_ID,
            master_host: None,
            directory: BrokerDirectory::new(),
            connections: ConnectionSet::new(),
            interfaces: HandlerTable::new(),
            pending: PendingCalls::new(),
            commands,
            connecting: HashSet::new(),
            tick_armed: false,
            sweep_armed: false,
        }
    }

    // ==================== inbound dispatch ==================== //

    /// The dispatch boundary for every frame a transport task delivers.
    /// Handler failures stop here.
    pub(crate) fn handle_message(&mut self, connection: ConnectionId, frame: Frame) {
        let handler = match self.commands.get(&frame.command) {
            Some(handler) => *handler,
            None => {
                tracing::warn!(
                    "No handler for command {} on connection {connection}, dropping frame",
                    frame.command
                );
                return;
            }
        };
        if let Err(err) = handler(self, connection, frame.body) {
            tracing::error!(
                "Dispatch of command {} on connection {connection} failed: '{err}'",
                frame.command
            );
        }
    }

    /// Registration response from a broker. `register_flag` < 0 is a
    /// rejection (name collision), 1 adopts the carried identity, anything
    /// else is a topology sync. On every non-rejection the directory is
    /// replaced wholesale and missing slave connections are repaired.
    pub(crate) fn handle_register_response(
        &mut self,
        _connection: ConnectionId,
        body: Bytes,
    ) -> HandlerResult {
        let response: RegisterResponse = protocol::decode(&body)?;
        if response.register_flag < 0 {
            tracing::error!("Registration rejected by the broker, service name already taken");
            let _ = self.registration.send(RegistrationStatus::Rejected);
            return Ok(());
        }
        if response.register_flag == 1 {
            self.node_id = response.node_id;
            self.bound_broker_id = response.bound_broker_id;
            let _ = self
                .registration
                .send(RegistrationStatus::Registered(response.node_id));
            tracing::info!(
                "Registered with the broker as node {} (bound broker {})",
                response.node_id,
                response.bound_broker_id
            );
        }
        self.directory.replace_from(&response);
        tracing::debug!(
            "Directory refreshed: {} services, {} slave brokers",
            self.directory.service_count(),
            self.directory.slave_brokers().len()
        );

        self.ensure_slave_connections();
        self.arm_tick();
        Ok(())
    }

    /// A routed envelope: an inbound call when `dest_service` is set, a
    /// reply completing a pending call when it is empty
    pub(crate) fn handle_route_message(
        &mut self,
        _connection: ConnectionId,
        body: Bytes,
    ) -> HandlerResult {
        let message: RouteMessage = protocol::decode(&body)?;

        if message.is_reply() {
            // the entry is consumed before the callback runs, so a failure
            // in the callback can never leak a pending call
            match self.pending.take(message.correlation_id) {
                Some(callback) => {
                    tracing::trace!("Reply for correlation id {}", message.correlation_id);
                    callback(Ok(message.body))?;
                }
                None => {
                    tracing::warn!(
                        "Reply for unknown correlation id {} dropped (late, duplicate or already answered)",
                        message.correlation_id
                    );
                }
            }
            return Ok(());
        }

        match self.interfaces.get(&message.dest_message) {
            Some(handler) => {
                tracing::trace!(
                    "Inbound call '{}' from node {}",
                    message.dest_message,
                    message.from_node_id
                );
                let call = InboundCall {
                    body: message.body,
                    from_node_id: message.from_node_id,
                    correlation_id: message.correlation_id,
                    bridge_route_id: message.bridge_route_id,
                    node: self.node.clone(),
                };
                handler(call)?;
            }
            None => {
                // intentional fire-and-forget degradation: no error reply
                tracing::error!(
                    "Service '{}' has no interface '{}' registered, dropping call",
                    message.dest_service,
                    message.dest_message
                );
            }
        }
        Ok(())
    }

    // ==================== outbound paths ==================== //

    /// Issue a call: allocate a correlation id for the callback, resolve
    /// the destination (unresolved services go out with the zero sentinel
    /// and are rejected downstream) and transmit on the bound broker
    pub(crate) fn start_call(
        &mut self,
        service: String,
        message: String,
        body: Bytes,
        callback: ReplyCallback,
    ) {
        let deadline = self.call_timeout.map(|timeout| Instant::now() + timeout);
        let correlation_id = self.pending.insert(callback, deadline);
        self.arm_sweep();

        let dest_node_id = self.directory.resolve(&service);
        tracing::trace!(
            "Call '{message}' -> service '{service}' (node {dest_node_id}, correlation {correlation_id})"
        );
        self.send_routed(RouteMessage {
            dest_service: service,
            dest_message: message,
            dest_node_id,
            from_node_id: self.node_id,
            correlation_id,
            bridge_route_id: 0,
            body,
        });
    }

    /// Issue a call into a remote broker group. A correlation id is only
    /// allocated when a callback was supplied; fire-and-forget calls omit
    /// correlation entirely.
    pub(crate) fn start_bridge_call(
        &mut self,
        group: String,
        service: String,
        message: String,
        body: Bytes,
        callback: Option<ReplyCallback>,
    ) {
        let correlation_id = match callback {
            Some(callback) => {
                let deadline = self.call_timeout.map(|timeout| Instant::now() + timeout);
                let id = self.pending.insert(callback, deadline);
                self.arm_sweep();
                id
            }
            None => 0,
        };

        let envelope = BridgeRouteMessage {
            dest_broker_group: group,
            service_name: service,
            message_name: message,
            from_node_id: self.node_id,
            correlation_id,
            body,
        };
        match self.connections.broker_route(self.bound_broker_id) {
            Some(connection) => send_on(connection, Command::BridgeRoute, &envelope),
            None => tracing::warn!(
                "No live broker connection, dropping bridge call to group '{}'",
                envelope.dest_broker_group
            ),
        }
    }

    /// Send a reply envelope back to the node that issued an inbound call
    pub(crate) fn send_response(
        &mut self,
        node_id: NodeId,
        correlation_id: u64,
        bridge_route_id: u64,
        body: Bytes,
    ) {
        self.send_routed(RouteMessage {
            dest_service: String::new(),
            dest_message: String::new(),
            dest_node_id: node_id,
            from_node_id: self.node_id,
            correlation_id,
            bridge_route_id,
            body,
        });
    }

    /// Transmit a routed envelope on the broker the node is bound to,
    /// trying the in-process router shortcut first when one is configured
    fn send_routed(&mut self, message: RouteMessage) {
        let mut message = message;
        if let Some(router) = &self.router {
            match router.route_to_broker(self.bound_broker_id, message) {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
        match self.connections.broker_route(self.bound_broker_id) {
            Some(connection) => send_on(connection, Command::RouteMessage, &message),
            None => tracing::warn!(
                "No live broker connection, dropping routed message to '{}'",
                message.dest_service
            ),
        }
    }

    // ==================== interfaces ==================== //

    pub(crate) fn bind_interface(&mut self, message_name: String, handler: CallHandler) {
        if self.interfaces.bind(message_name.clone(), handler).is_some() {
            tracing::warn!("Interface '{message_name}' was already bound, replacing");
        }
        // a late binding still reaches the broker over the live connection
        if self.connections.master().is_some() {
            self.advertise_interfaces();
        }
    }

    /// Advertise the message names bound right now. Sent on every fresh
    /// master connection (initial registration and post-reconnect alike);
    /// nothing is sent while no interfaces are bound.
    pub(crate) fn advertise_interfaces(&self) {
        if self.interfaces.is_empty() {
            return;
        }
        let master = match self.connections.master() {
            Some(master) => master,
            None => return,
        };
        let advertisement = InterfaceAdvertisement {
            binder_broker_id: self
                .router
                .as_ref()
                .and_then(|router| router.colocated_broker())
                .unwrap_or(0),
            service_name: self.service_name.clone(),
            message_names: self.interfaces.keys().cloned().collect(),
        };
        send_on(master, Command::InterfaceAdvertisement, &advertisement);
    }

    // ============== connection lifecycle & reconnection ============== //

    /// First master connection, posted by `open`
    pub(crate) fn install_master(&mut self, host: String, connection: Connection) {
        self.master_host = Some(host);
        self.install_master_connection(connection);
    }

    fn install_master_connection(&mut self, connection: Connection) {
        self.connections.set_master(connection);
        if let Some(master) = self.connections.master() {
            send_on(
                master,
                Command::RegisterRequest,
                &RegisterRequest {
                    service_name: self.service_name.clone(),
                    node_id: self.node_id,
                },
            );
        }
        self.advertise_interfaces();
    }

    fn install_slave_connection(&mut self, connection: Connection) {
        // every broker connection carries the same registration message;
        // the broker tells master registration and slave affiliation apart
        // by which connection it arrived on
        send_on(
            &connection,
            Command::RegisterRequest,
            &RegisterRequest {
                service_name: self.service_name.clone(),
                node_id: self.node_id,
            },
        );
        send_on(
            &connection,
            Command::SlaveRegister,
            &SlaveRegister {
                node_id: self.node_id,
            },
        );
        self.connections.insert_slave(connection);
    }

    /// A transport-reported break. Evicts exactly the matching entry and
    /// arms the reconnect check; the connection handle (and with it the
    /// writer task) is released here, before any reconnect can reuse the
    /// broker id slot.
    pub(crate) fn handle_disconnect(&mut self, connection: ConnectionId) {
        match self.connections.remove_by_connection(connection) {
            Some(broken) => {
                tracing::info!(
                    "Broker session closed for {} (broker id {})",
                    broken.peer_addr(),
                    broken.broker_id()
                );
                drop(broken);
                self.arm_tick();
            }
            None => {
                tracing::trace!("Break reported for unknown connection {connection}, ignoring");
            }
        }
    }

    /// Open a connection for every directory slave we are not connected to
    /// (and not already connecting to)
    pub(crate) fn ensure_slave_connections(&mut self) {
        let missing = self
            .directory
            .slave_brokers()
            .iter()
            .filter(|(_, broker_id)| {
                !self.connections.has_broker(**broker_id) && !self.connecting.contains(broker_id)
            })
            .map(|(host, broker_id)| (host.clone(), *broker_id))
            .collect::<Vec<_>>();
        for (host, broker_id) in missing {
            self.spawn_connect(broker_id, host);
        }
    }

    fn spawn_connect(&mut self, broker_id: NodeId, host: String) {
        if !self.connecting.insert(broker_id) {
            return;
        }
        tracing::debug!("Connecting to broker {broker_id} at {host}");
        let node = self.node.clone();
        let events: Arc<dyn TransportEvents> = self.node.events.clone();
        tokio::spawn(async move {
            let result = crate::net::connect(&host, broker_id, events).await;
            node.queue
                .post(move |state| state.finish_connect(broker_id, result));
        });
    }

    pub(crate) fn finish_connect(
        &mut self,
        broker_id: NodeId,
        result: Result<Connection, tokio::io::Error>,
    ) {
        self.connecting.remove(&broker_id);
        match result {
            Ok(connection) => {
                if broker_id == MASTER_BROKER_ID {
                    self.install_master_connection(connection);
                } else {
                    self.install_slave_connection(connection);
                }
            }
            Err(err) => {
                tracing::warn!("Failed to connect to broker {broker_id}: '{err}'");
                self.arm_tick();
            }
        }
    }

    pub(crate) fn arm_tick(&mut self) {
        if self.tick_armed {
            return;
        }
        self.tick_armed = true;
        self.node
            .queue
            .post_after(self.reconnect_interval, |state| state.reconnect_tick());
    }

    /// The delayed reconnect check: repair the master connection, walk the
    /// slave list for missing connections, re-arm. Once armed (first
    /// registration response or first break) the check keeps itself alive.
    pub(crate) fn reconnect_tick(&mut self) {
        self.tick_armed = false;
        if self.connections.master().is_none() && !self.connecting.contains(&MASTER_BROKER_ID) {
            if let Some(host) = self.master_host.clone() {
                self.spawn_connect(MASTER_BROKER_ID, host);
            }
        }
        self.ensure_slave_connections();
        self.arm_tick();
    }

    // ==================== pending-call deadlines ==================== //

    fn arm_sweep(&mut self) {
        let interval = match self.call_timeout {
            Some(interval) => interval,
            None => return,
        };
        if self.sweep_armed {
            return;
        }
        self.sweep_armed = true;
        self.node
            .queue
            .post_after(interval, |state| state.sweep_pending());
    }

    /// Expire pending calls whose deadline passed, completing each callback
    /// with a timeout error
    pub(crate) fn sweep_pending(&mut self) {
        self.sweep_armed = false;
        for (correlation_id, callback) in self.pending.expired(Instant::now()) {
            tracing::warn!("Pending call {correlation_id} expired without a reply");
            if let Err(err) = callback(Err(CallError::TimedOut)) {
                tracing::error!(
                    "Reply callback for expired call {correlation_id} failed: '{err}'"
                );
            }
        }
        if !self.pending.is_empty() {
            self.arm_sweep();
        }
    }
}

/// Encode and queue an envelope on a connection, logging (never surfacing)
/// codec and outbox failures
fn send_on(connection: &Connection, command: Command, envelope: &impl Serialize) {
    match protocol::encode(envelope) {
        Ok(body) => {
            if !connection.send(command, body) {
                tracing::warn!(
                    "Outbox for connection {} is closed, dropping {:?} envelope",
                    connection.id(),
                    command
                );
            }
        }
        Err(err) => tracing::error!("Failed to encode {:?} envelope: '{err}'", command),
    }
}
