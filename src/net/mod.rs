// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Outbound broker connections and the transport event boundary.
//!
//! A [Connection] is the node-side handle to one live broker session: an
//! outbox feeding the session's writer task, tagged with the remote
//! broker's logical id. The reader and writer tasks live in `session` and
//! never touch node state — everything they observe is delivered through
//! the [TransportEvents] callbacks, whose implementation re-posts onto the
//! node's task queue.

pub(crate) mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{Command, Frame};
use crate::NodeId;

/// Unique id assigned to each connection the node opens. Used to match a
/// transport-reported break back to the connection-set entry it belongs to.
pub type ConnectionId = u64;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Callbacks delivered from transport tasks when a frame arrives or a
/// connection breaks.
///
/// Implementations must not block and must not mutate node state directly;
/// they post a job onto the node's task queue and return.
pub trait TransportEvents: Send + Sync + 'static {
    /// A complete frame was read off the connection
    fn message_received(&self, connection: ConnectionId, frame: Frame);
    /// The connection broke (EOF or I/O error)
    fn connection_closed(&self, connection: ConnectionId);
}

/// The node-side handle to a live broker connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    broker_id: NodeId,
    peer_addr: SocketAddr,
    outbox: mpsc::UnboundedSender<Frame>,
}

impl Connection {
    /// This connection's unique id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The logical id of the broker on the remote end
    /// ([crate::MASTER_BROKER_ID] for the master)
    pub fn broker_id(&self) -> NodeId {
        self.broker_id
    }

    /// The remote address of the connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue an envelope for transmission. Returns `false` when the writer
    /// task is gone (connection already broken); the caller treats that the
    /// same as an in-flight loss.
    pub fn send(&self, command: Command, body: Bytes) -> bool {
        self.outbox
            .send(Frame {
                command: command as u16,
                body,
            })
            .is_ok()
    }

    /// A connection backed by a bare channel instead of a socket, so tests
    /// can observe exactly what the node transmits
    #[cfg(test)]
    pub(crate) fn in_memory(broker_id: NodeId) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: next_connection_id(),
                broker_id,
                peer_addr: "127.0.0.1:0".parse().expect("literal address parses"),
                outbox: tx,
            },
            rx,
        )
    }
}

/// Open a connection to a broker and spawn its reader/writer tasks.
///
/// * `host` - The broker's network address
/// * `broker_id` - The logical id this connection will be tagged with
/// * `events` - Sink for frames and disconnect notifications
///
/// Returns the [Connection] handle on success; the caller is responsible
/// for sending the registration traffic on it.
pub async fn connect(
    host: &str,
    broker_id: NodeId,
    events: Arc<dyn TransportEvents>,
) -> Result<Connection, tokio::io::Error> {
    let stream = TcpStream::connect(host).await?;
    let peer_addr = stream.peer_addr()?;
    let id = next_connection_id();
    let outbox = session::spawn_io(stream, id, events);

    tracing::info!("Broker session opened for {peer_addr} (broker id {broker_id})");
    Ok(Connection {
        id,
        broker_id,
        peer_addr,
        outbox,
    })
}
