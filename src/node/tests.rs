// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Node state machine tests, driving the handlers directly and asserting on
//! state plus the frames emitted on in-memory connections. The last test
//! runs a full node against a scripted broker over real TCP.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use super::state::NodeState;
use super::{NodeConfig, NodeEvents, RegistrationStatus, RpcNode};
use crate::executor::{JobReceiver, TaskQueue};
use crate::net::Connection;
use crate::protocol::{
    self, Command, Frame, InterfaceAdvertisement, RegisterRequest, RegisterResponse, RouteMessage,
    SlaveRegister,
};
use crate::registry::CallError;

/// A state/queue/handle triple wired together like [RpcNode::new] does it,
/// but with the state held locally so tests can step jobs by hand
fn test_node(config: NodeConfig) -> (NodeState, JobReceiver<NodeState>, RpcNode) {
    let service_name = config
        .service_name
        .clone()
        .unwrap_or_else(|| "A".to_string());
    let (queue, jobs) = TaskQueue::channel();
    let (registration_tx, registration_rx) = watch::channel(RegistrationStatus::Unregistered);
    let events = Arc::new(NodeEvents {
        queue: queue.clone(),
    });
    let node = RpcNode {
        queue,
        registration: registration_rx,
        open_timeout: config.open_timeout,
        service_name: service_name.clone(),
        events,
    };
    let state = NodeState::new(node.clone(), service_name, &config, registration_tx);
    (state, jobs, node)
}

fn encoded<T: serde::Serialize>(value: &T) -> Bytes {
    protocol::encode(value).expect("Envelope should encode")
}

/// A registration response naming two services: "A" on node 7 (this node)
/// and "B" on node 9
fn mesh_response(flag: i32) -> RegisterResponse {
    let mut response = RegisterResponse {
        register_flag: flag,
        node_id: 7,
        bound_broker_id: 0,
        ..Default::default()
    };
    response.service_to_node.insert("A".to_string(), 7);
    response.service_to_node.insert("B".to_string(), 9);
    response
}

#[tokio::test]
async fn registration_success_adopts_identity() {
    let (mut state, _jobs, node) = test_node(NodeConfig::default());

    state
        .handle_register_response(1, encoded(&mesh_response(1)))
        .expect("Registration response should dispatch");

    assert_eq!(state.node_id, 7);
    assert_eq!(state.bound_broker_id, 0);
    assert_eq!(node.registration_status(), RegistrationStatus::Registered(7));
    assert_eq!(node.node_id(), 7);
    assert_eq!(state.directory.resolve("B"), 9);
    assert!(state.tick_armed);
}

#[tokio::test]
async fn registration_rejection_leaves_state_untouched() {
    let (mut state, _jobs, node) = test_node(NodeConfig::default());

    state
        .handle_register_response(1, encoded(&mesh_response(-1)))
        .expect("Rejection should dispatch cleanly");

    assert_eq!(state.node_id, 0);
    assert_eq!(node.registration_status(), RegistrationStatus::Rejected);
    assert_eq!(node.node_id(), 0);
    // the rejection carries no usable topology
    assert_eq!(state.directory.service_count(), 0);
    assert!(!state.tick_armed);
}

#[tokio::test]
async fn topology_sync_refreshes_directory_only() {
    let (mut state, _jobs, node) = test_node(NodeConfig::default());
    state
        .handle_register_response(1, encoded(&mesh_response(1)))
        .expect("Registration response should dispatch");

    let mut sync = mesh_response(0);
    sync.node_id = 99; // identity in a sync must not be adopted
    sync.service_to_node.insert("C".to_string(), 11);
    state
        .handle_register_response(1, encoded(&sync))
        .expect("Topology sync should dispatch");

    assert_eq!(state.node_id, 7);
    assert_eq!(node.registration_status(), RegistrationStatus::Registered(7));
    assert_eq!(state.directory.resolve("C"), 11);
}

#[tokio::test]
async fn calls_route_on_the_master_connection() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    state
        .handle_register_response(1, encoded(&mesh_response(1)))
        .expect("Registration response should dispatch");
    let (master, mut master_rx) = Connection::in_memory(0);
    state.connections.set_master(master);

    state.start_call(
        "B".to_string(),
        "B.ping".to_string(),
        Bytes::from_static(b"ping"),
        Box::new(|_| Ok(())),
    );

    let frame = master_rx.try_recv().expect("Call should be transmitted");
    assert_eq!(frame.command, Command::RouteMessage as u16);
    let message: RouteMessage = protocol::decode(&frame.body).expect("Envelope should decode");
    assert_eq!(message.dest_service, "B");
    assert_eq!(message.dest_message, "B.ping");
    assert_eq!(message.dest_node_id, 9);
    assert_eq!(message.from_node_id, 7);
    assert_eq!(message.correlation_id, 1);
    assert_eq!(message.bridge_route_id, 0);
    assert!(!message.is_reply());
    assert_eq!(state.pending.len(), 1);
}

#[tokio::test]
async fn unresolved_services_are_still_transmitted() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let (master, mut master_rx) = Connection::in_memory(0);
    state.connections.set_master(master);

    state.start_call(
        "ghost".to_string(),
        "ghost.poke".to_string(),
        Bytes::new(),
        Box::new(|_| Ok(())),
    );

    let frame = master_rx.try_recv().expect("Call should be transmitted");
    let message: RouteMessage = protocol::decode(&frame.body).expect("Envelope should decode");
    // the zero sentinel: the broker rejects it downstream
    assert_eq!(message.dest_node_id, 0);
}

#[tokio::test]
async fn a_reply_completes_the_pending_call_exactly_once() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let invocations = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(None));

    let (cb_invocations, cb_seen) = (invocations.clone(), seen.clone());
    state.start_call(
        "B".to_string(),
        "B.ping".to_string(),
        Bytes::new(),
        Box::new(move |reply| {
            cb_invocations.fetch_add(1, Ordering::SeqCst);
            *cb_seen.lock().expect("lock poisoned") = Some(reply);
            Ok(())
        }),
    );

    let reply = RouteMessage {
        dest_node_id: 7,
        from_node_id: 9,
        correlation_id: 1,
        body: Bytes::from_static(b"pong"),
        ..Default::default()
    };
    state
        .handle_route_message(1, encoded(&reply))
        .expect("Reply should dispatch");

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        seen.lock().expect("lock poisoned").clone(),
        Some(Ok(Bytes::from_static(b"pong")))
    );
    assert!(state.pending.is_empty());

    // a duplicate of the same reply is dropped, the callback stays at one
    state
        .handle_route_message(1, encoded(&reply))
        .expect("Duplicate reply should dispatch cleanly");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn replies_for_unknown_correlations_are_dropped() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let stray = RouteMessage {
        correlation_id: 42,
        body: Bytes::from_static(b"late"),
        ..Default::default()
    };
    state
        .handle_route_message(1, encoded(&stray))
        .expect("Stray reply should dispatch cleanly");
    assert!(state.pending.is_empty());
}

#[tokio::test]
async fn inbound_calls_dispatch_to_the_bound_interface() {
    let (mut state, mut jobs, _node) = test_node(NodeConfig::default());
    state
        .handle_register_response(1, encoded(&mesh_response(1)))
        .expect("Registration response should dispatch");
    let (master, mut master_rx) = Connection::in_memory(0);
    state.connections.set_master(master);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    state.bind_interface(
        "A.echo".to_string(),
        Box::new(move |call| {
            handler_seen
                .lock()
                .expect("lock poisoned")
                .push(call.body.clone());
            call.reply(Bytes::from_static(b"pong"));
            Ok(())
        }),
    );
    // binding with a live master re-advertises; not under test here
    let _ = master_rx.try_recv();

    let call = RouteMessage {
        dest_service: "A".to_string(),
        dest_message: "A.echo".to_string(),
        dest_node_id: 7,
        from_node_id: 9,
        correlation_id: 5,
        ..Default::default()
    };
    state
        .handle_route_message(1, encoded(&call))
        .expect("Call should dispatch");
    assert_eq!(
        *seen.lock().expect("lock poisoned"),
        vec![Bytes::new()]
    );

    // the handler's reply went through the queue; apply it and inspect the
    // emitted envelope
    assert_eq!(jobs.drain_now(&mut state), 1);
    let frame = master_rx.try_recv().expect("Reply should be transmitted");
    let reply: RouteMessage = protocol::decode(&frame.body).expect("Envelope should decode");
    assert!(reply.is_reply());
    assert_eq!(reply.dest_node_id, 9);
    assert_eq!(reply.from_node_id, 7);
    assert_eq!(reply.correlation_id, 5);
    assert_eq!(reply.body, Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn unknown_message_names_drop_the_call_without_a_reply() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let (master, mut master_rx) = Connection::in_memory(0);
    state.connections.set_master(master);

    let call = RouteMessage {
        dest_service: "A".to_string(),
        dest_message: "A.missing".to_string(),
        from_node_id: 9,
        correlation_id: 5,
        ..Default::default()
    };
    state
        .handle_route_message(1, encoded(&call))
        .expect("Unroutable call should dispatch cleanly");
    assert!(master_rx.try_recv().is_err());
}

#[tokio::test]
async fn a_fresh_master_connection_carries_registration_and_advertisement() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    state.bind_interface("A.echo".to_string(), Box::new(|_| Ok(())));
    state.bind_interface("A.stats".to_string(), Box::new(|_| Ok(())));

    let (master, mut master_rx) = Connection::in_memory(0);
    state.install_master("127.0.0.1:10241".to_string(), master);

    let register = master_rx.try_recv().expect("Registration should be sent");
    assert_eq!(register.command, Command::RegisterRequest as u16);
    let request: RegisterRequest =
        protocol::decode(&register.body).expect("Envelope should decode");
    assert_eq!(request.service_name, "A");
    assert_eq!(request.node_id, 0);

    let advert = master_rx.try_recv().expect("Advertisement should be sent");
    assert_eq!(advert.command, Command::InterfaceAdvertisement as u16);
    let advertisement: InterfaceAdvertisement =
        protocol::decode(&advert.body).expect("Envelope should decode");
    assert_eq!(advertisement.service_name, "A");
    assert_eq!(
        advertisement.message_names.iter().collect::<Vec<_>>(),
        vec!["A.echo", "A.stats"]
    );
    assert_eq!(state.master_host.as_deref(), Some("127.0.0.1:10241"));
}

#[tokio::test]
async fn late_bindings_readvertise_the_full_interface() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let (master, mut master_rx) = Connection::in_memory(0);
    state.install_master("127.0.0.1:10241".to_string(), master);
    let _ = master_rx.try_recv(); // registration
    assert!(master_rx.try_recv().is_err()); // nothing bound yet, no advert...

    state.bind_interface("A.echo".to_string(), Box::new(|_| Ok(())));
    let advert = master_rx.try_recv().expect("Advertisement should be sent");
    let advertisement: InterfaceAdvertisement =
        protocol::decode(&advert.body).expect("Envelope should decode");
    assert_eq!(
        advertisement.message_names.iter().collect::<Vec<_>>(),
        vec!["A.echo"]
    );
}

#[tokio::test]
async fn slave_connections_register_and_affiliate() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    state.node_id = 7;

    let (slave, mut slave_rx) = Connection::in_memory(3);
    state.finish_connect(3, Ok(slave));

    let register = slave_rx.try_recv().expect("Registration should be sent");
    assert_eq!(register.command, Command::RegisterRequest as u16);
    let request: RegisterRequest =
        protocol::decode(&register.body).expect("Envelope should decode");
    assert_eq!(request.node_id, 7);

    let affiliate = slave_rx.try_recv().expect("Affiliation should be sent");
    assert_eq!(affiliate.command, Command::SlaveRegister as u16);
    let slave_register: SlaveRegister =
        protocol::decode(&affiliate.body).expect("Envelope should decode");
    assert_eq!(slave_register.node_id, 7);
    assert!(state.connections.has_broker(3));
}

#[tokio::test]
async fn a_break_evicts_exactly_the_matching_connection() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let (master, _master_rx) = Connection::in_memory(0);
    let (slave3, _slave3_rx) = Connection::in_memory(3);
    let (slave4, _slave4_rx) = Connection::in_memory(4);
    let broken_id = slave3.id();
    state.connections.set_master(master);
    state.connections.insert_slave(slave3);
    state.connections.insert_slave(slave4);

    state.handle_disconnect(broken_id);

    assert_eq!(state.connections.len(), 2);
    assert!(!state.connections.has_broker(3));
    assert!(state.connections.has_broker(4));
    assert!(state.connections.master().is_some());
    assert!(state.tick_armed);

    // a second report for the same break is a no-op
    state.handle_disconnect(broken_id);
    assert_eq!(state.connections.len(), 2);
}

#[tokio::test]
async fn a_master_break_clears_only_the_master() {
    let (mut state, _jobs, _node) = test_node(NodeConfig::default());
    let (master, _master_rx) = Connection::in_memory(0);
    let (slave, _slave_rx) = Connection::in_memory(3);
    let master_id = master.id();
    state.connections.set_master(master);
    state.connections.insert_slave(slave);

    state.handle_disconnect(master_id);

    assert!(state.connections.master().is_none());
    assert!(state.connections.has_broker(3));
    assert!(state.tick_armed);
}

#[tokio::test]
async fn expired_calls_complete_with_a_timeout_error() {
    let (mut state, _jobs, _node) = test_node(NodeConfig {
        call_timeout: Some(Duration::ZERO),
        ..Default::default()
    });

    let seen = Arc::new(Mutex::new(None));
    let cb_seen = seen.clone();
    state.start_call(
        "B".to_string(),
        "B.ping".to_string(),
        Bytes::new(),
        Box::new(move |reply| {
            *cb_seen.lock().expect("lock poisoned") = Some(reply);
            Ok(())
        }),
    );
    assert_eq!(state.pending.len(), 1);

    state.sweep_pending();
    assert!(state.pending.is_empty());
    assert_eq!(
        seen.lock().expect("lock poisoned").clone(),
        Some(Err(CallError::TimedOut))
    );
}

// ==================== scripted-broker integration ==================== //

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let length = stream
        .read_u64()
        .await
        .expect("Length prefix should arrive") as usize;
    let mut buf = vec![0u8; length];
    stream
        .read_exact(&mut buf)
        .await
        .expect("Frame body should arrive");
    let mut body = Bytes::from(buf);
    let header = body.split_to(2);
    Frame {
        command: u16::from_be_bytes([header[0], header[1]]),
        body,
    }
}

async fn write_frame(stream: &mut TcpStream, command: Command, body: Bytes) {
    let mut buf = Vec::with_capacity(body.len() + 10);
    buf.extend_from_slice(&((body.len() + 2) as u64).to_be_bytes());
    buf.extend_from_slice(&(command as u16).to_be_bytes());
    buf.extend_from_slice(&body);
    stream.write_all(&buf).await.expect("Frame should transmit");
}

#[tokio::test]
async fn a_node_registers_and_calls_through_a_scripted_broker() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Listener has an address");

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("Failed to accept");

        let register = read_frame(&mut stream).await;
        assert_eq!(register.command, Command::RegisterRequest as u16);
        let request: RegisterRequest =
            protocol::decode(&register.body).expect("Envelope should decode");
        assert_eq!(request.service_name, "echo");

        let advert = read_frame(&mut stream).await;
        assert_eq!(advert.command, Command::InterfaceAdvertisement as u16);

        let mut response = RegisterResponse {
            register_flag: 1,
            node_id: 7,
            ..Default::default()
        };
        response.service_to_node.insert("echo".to_string(), 7);
        response.service_to_node.insert("B".to_string(), 9);
        write_frame(
            &mut stream,
            Command::RegisterResponse,
            protocol::encode(&response).expect("Envelope should encode"),
        )
        .await;

        // the node's call comes through; answer it in place of node 9
        let frame = read_frame(&mut stream).await;
        assert_eq!(frame.command, Command::RouteMessage as u16);
        let call: RouteMessage = protocol::decode(&frame.body).expect("Envelope should decode");
        assert_eq!(call.dest_service, "B");
        assert_eq!(call.dest_node_id, 9);
        assert_eq!(call.from_node_id, 7);
        assert_eq!(call.body, Bytes::from_static(b"ping"));

        let reply = RouteMessage {
            dest_node_id: call.from_node_id,
            from_node_id: 9,
            correlation_id: call.correlation_id,
            body: Bytes::from_static(b"pong"),
            ..Default::default()
        };
        write_frame(
            &mut stream,
            Command::RouteMessage,
            protocol::encode(&reply).expect("Envelope should encode"),
        )
        .await;
        stream
            .flush()
            .await
            .expect("Reply should flush before the broker exits");
    });

    let node = RpcNode::new(NodeConfig {
        service_name: Some("echo".to_string()),
        ..Default::default()
    });
    node.register_interface("echo.ping", |call| {
        call.reply(Bytes::new());
        Ok(())
    });

    let node_id = node
        .open(addr.to_string())
        .await
        .expect("Open should succeed against the scripted broker");
    assert_eq!(node_id, 7);
    assert_eq!(node.node_id(), 7);
    assert!(node.is_exist("B").await);
    assert!(!node.is_exist("ghost").await);

    let (tx, rx) = oneshot::channel();
    node.call("B", "B.ping", &b"ping"[..], move |reply| {
        let _ = tx.send(reply);
        Ok(())
    });
    let reply = rx
        .await
        .expect("Callback should run")
        .expect("Call should complete with a reply");
    assert_eq!(reply, Bytes::from_static(b"pong"));

    broker.await.expect("Broker script should complete");
}
