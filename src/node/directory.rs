// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The node's view of mesh topology and its live broker connections.
//!
//! [BrokerDirectory] is only ever replaced wholesale from a registration
//! response — there are no partial-field updates, so code reading it on the
//! drain task never observes a half-applied topology. [ConnectionSet] holds
//! at most one connection per broker id; eviction on a break removes
//! exactly the entry whose connection id matches the broken one.

use std::collections::HashMap;

use crate::net::{Connection, ConnectionId};
use crate::protocol::RegisterResponse;
use crate::{NodeId, MASTER_BROKER_ID};

/// This node's cached view of the mesh: which node hosts each service and
/// which slave brokers exist
#[derive(Debug, Default)]
pub struct BrokerDirectory {
    service_to_node: HashMap<String, NodeId>,
    slave_brokers: HashMap<String, NodeId>,
}

impl BrokerDirectory {
    /// An empty directory (the state before the first registration
    /// response)
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole directory from a registration response
    pub fn replace_from(&mut self, response: &RegisterResponse) {
        self.service_to_node = response.service_to_node.clone();
        self.slave_brokers = response.slave_brokers.clone();
    }

    /// Resolve a service name to its hosting node id. Unknown services
    /// resolve to the zero sentinel — the call is still transmitted and
    /// rejected downstream by the broker.
    pub fn resolve(&self, service: &str) -> NodeId {
        self.service_to_node.get(service).copied().unwrap_or(0)
    }

    /// Whether the service is known to the directory
    pub fn contains_service(&self, service: &str) -> bool {
        self.service_to_node.contains_key(service)
    }

    /// The known slave brokers, host address to broker id
    pub fn slave_brokers(&self) -> &HashMap<String, NodeId> {
        &self.slave_brokers
    }

    /// Number of services in the directory
    pub fn service_count(&self) -> usize {
        self.service_to_node.len()
    }
}

/// The node's live outbound connections: the master broker plus any slave
/// brokers, keyed by broker id
#[derive(Debug, Default)]
pub struct ConnectionSet {
    master: Option<Connection>,
    slaves: HashMap<NodeId, Connection>,
}

impl ConnectionSet {
    /// An empty connection set
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the master connection, dropping (and thereby closing) any
    /// previous one
    pub fn set_master(&mut self, connection: Connection) {
        self.master = Some(connection);
    }

    /// The master connection, if live
    pub fn master(&self) -> Option<&Connection> {
        self.master.as_ref()
    }

    /// Install a slave connection under its broker id, dropping any
    /// previous connection for that id
    pub fn insert_slave(&mut self, connection: Connection) {
        self.slaves.insert(connection.broker_id(), connection);
    }

    /// Whether a live connection exists for the broker id
    pub fn has_broker(&self, broker_id: NodeId) -> bool {
        if broker_id == MASTER_BROKER_ID {
            self.master.is_some()
        } else {
            self.slaves.contains_key(&broker_id)
        }
    }

    /// The connection calls should be routed on: the bound broker when the
    /// node is affiliated with one, the master otherwise
    pub fn broker_route(&self, bound_broker_id: NodeId) -> Option<&Connection> {
        if bound_broker_id == MASTER_BROKER_ID {
            self.master.as_ref()
        } else {
            self.slaves.get(&bound_broker_id)
        }
    }

    /// Evict the entry whose connection matches the broken one. Only the
    /// matching entry is removed; an unknown id (e.g. a connection already
    /// replaced) evicts nothing.
    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> Option<Connection> {
        if let Some(master) = &self.master {
            if master.id() == connection {
                return self.master.take();
            }
        }
        let broker_id = self
            .slaves
            .iter()
            .find(|(_, conn)| conn.id() == connection)
            .map(|(broker_id, _)| *broker_id)?;
        self.slaves.remove(&broker_id)
    }

    /// Number of live connections (master included)
    pub fn len(&self) -> usize {
        self.slaves.len() + usize::from(self.master.is_some())
    }

    /// Whether no connections are live
    pub fn is_empty(&self) -> bool {
        self.master.is_none() && self.slaves.is_empty()
    }
}
