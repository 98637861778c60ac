//! Integration tests wiring two full `Node`s over real UDP sockets on
//! localhost: handshake, encrypted request/response, and multi-fragment
//! delivery end to end (§8).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quicnet_core::config::{self, NodeConfig};
use quicnet_core::crypto::Keypair;
use quicnet_core::error::{CoreError, FlowError};
use quicnet_core::ids::TimeOrderedId128;
use quicnet_core::message::{Handler, HandlerRegistry, P2PMessage, ProtocolCode};
use quicnet_core::Node;

/// Binds a node to an OS-assigned localhost port and starts its event loop.
/// Returns the node's run-loop task alongside it so a test can abort it to
/// simulate the peer going dark mid-connection.
async fn spawn_node_with_config(
    registry: HandlerRegistry,
    config: NodeConfig,
) -> (Arc<Node>, SocketAddr, tokio::task::JoinHandle<()>) {
    let node = Arc::new(
        Node::bind(config, Keypair::generate(), registry)
            .await
            .expect("bind to an ephemeral localhost port"),
    );
    let addr = node.socket.local_addr().expect("bound socket has a local address");
    let run_node = node.clone();
    let handle = tokio::spawn(async move {
        let _ = run_node.run().await;
    });
    (node, addr, handle)
}

async fn spawn_node(registry: HandlerRegistry) -> (Arc<Node>, SocketAddr) {
    let config = NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..NodeConfig::default()
    };
    let (node, addr, _handle) = spawn_node_with_config(registry, config).await;
    (node, addr)
}

#[tokio::test]
async fn handshake_assigns_the_same_connection_id_on_both_peers() {
    let (node_a, _addr_a) = spawn_node(HandlerRegistry::new()).await;
    let (node_b, addr_b) = spawn_node(HandlerRegistry::new()).await;

    let connection_id = node_a.connect(addr_b).await.expect("handshake succeeds");

    // the responder spawns its side of the connection after replying; give
    // its task a moment to register before asserting on it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conn_a = node_a.connections.get(connection_id).expect("initiator tracks the connection");
    let conn_b = node_b.connections.get(connection_id).expect("responder adopted the initiator's connectionId");
    assert_eq!(conn_a.connection_id, conn_b.connection_id);
    assert_eq!(conn_a.shared_secret, conn_b.shared_secret, "both sides derived the same session key");
}

#[tokio::test]
async fn single_fragment_request_round_trips_through_encrypted_transport() {
    let registry_b = HandlerRegistry::new();
    registry_b
        .register(
            ProtocolCode::TextV1,
            Handler::Result(Arc::new(|message| {
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&message.payload);
                reply
            })),
        )
        .expect("TextV1 declares a response, Result handler matches");

    let (node_a, _addr_a) = spawn_node(HandlerRegistry::new()).await;
    let (node_b, addr_b) = spawn_node(registry_b).await;

    let connection_id = node_a.connect(addr_b).await.expect("handshake succeeds");
    let connection = node_a.connections.get(connection_id).expect("connection registered after connect");

    let response = node_a
        .request(&connection, ProtocolCode::TextV1, b"hello".to_vec(), Duration::from_secs(2))
        .await
        .expect("request resolves before the deadline");

    assert_eq!(response, b"echo:hello");
    // the connection only ever existed on the wire under the one shared id
    let _ = node_b;
}

#[tokio::test]
async fn multi_fragment_message_reassembles_across_the_wire() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_handler = received.clone();
    let registry_b = HandlerRegistry::new();
    registry_b
        .register(
            ProtocolCode::HeartbeatV1,
            Handler::Void(Arc::new(move |message| {
                *received_for_handler.lock().expect("mutex poisoned") = message.payload.clone();
            })),
        )
        .expect("HeartbeatV1 is void, Void handler matches");

    let (node_a, _addr_a) = spawn_node(HandlerRegistry::new()).await;
    let (node_b, addr_b) = spawn_node(registry_b).await;
    let _ = &node_b;

    let connection_id = node_a.connect(addr_b).await.expect("handshake succeeds");
    let connection = node_a.connections.get(connection_id).expect("connection registered after connect");

    // three full fragments plus a partial one, well past a single MTU.
    let payload = vec![0xABu8; config::MAX_FRAME_PAYLOAD * 3 + 17];
    let id_gen = TimeOrderedId128::new();
    let message = P2PMessage::new_normal(
        *node_a.keypair.public_key(),
        ProtocolCode::HeartbeatV1,
        payload.clone(),
        &id_gen,
    );
    node_a.send_message(&connection, message).await.expect("flow control has room for this send");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if *received.lock().expect("mutex poisoned") == payload {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "message never fully reassembled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn one_node_can_hold_distinct_connections_to_two_peers() {
    let (node_a, _addr_a) = spawn_node(HandlerRegistry::new()).await;
    let (node_b, addr_b) = spawn_node(HandlerRegistry::new()).await;
    let (node_c, addr_c) = spawn_node(HandlerRegistry::new()).await;
    let _ = (&node_b, &node_c);

    let id_b = node_a.connect(addr_b).await.expect("handshake with b succeeds");
    let id_c = node_a.connect(addr_c).await.expect("handshake with c succeeds");

    assert_ne!(id_b, id_c);
    assert!(node_a.connections.get(id_b).is_some());
    assert!(node_a.connections.get(id_c).is_some());
}

/// §8 scenario 5: once the peer stops responding, retransmits exhaust their
/// budget and the connection is torn down with `PeerUnreachable` surfaced
/// to a caller blocked in `request`, rather than hanging forever.
#[tokio::test]
async fn peer_going_dark_surfaces_peer_unreachable_and_evicts_the_connection() {
    let config_a = NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_retransmit: 1,
        ..NodeConfig::default()
    };
    let (node_a, _addr_a, _handle_a) = spawn_node_with_config(HandlerRegistry::new(), config_a).await;
    let config_b = NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..NodeConfig::default()
    };
    let (node_b, addr_b, handle_b) = spawn_node_with_config(HandlerRegistry::new(), config_b).await;

    let connection_id = node_a.connect(addr_b).await.expect("handshake succeeds");
    let connection = node_a.connections.get(connection_id).expect("connection registered after connect");

    // the peer goes dark: stop its event loop so it never ACKs again.
    handle_b.abort();
    let _ = &node_b;

    let result = node_a
        .request(&connection, ProtocolCode::TextV1, b"hello".to_vec(), Duration::from_secs(5))
        .await;

    assert!(
        matches!(result, Err(CoreError::Conn(quicnet_core::error::ConnError::PeerUnreachable))),
        "expected PeerUnreachable, got {result:?}"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if node_a.connections.get(connection_id).is_none() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "connection was never evicted after going unreachable");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// §8 scenario 6: a send that can never acquire a permit under the node's
/// own global flow cap is cancelled rather than silently dropped, and the
/// cancellation unwinds its half-registered send-side state.
#[tokio::test]
async fn send_blocked_by_global_flow_cap_surfaces_backpressured() {
    let config_a = NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        global_inflight_cap_bytes: 1,
        ..NodeConfig::default()
    };
    let (node_a, _addr_a, _handle_a) = spawn_node_with_config(HandlerRegistry::new(), config_a).await;
    let (_node_b, addr_b) = spawn_node(HandlerRegistry::new()).await;

    let connection_id = node_a.connect(addr_b).await.expect("handshake succeeds");
    let connection = node_a.connections.get(connection_id).expect("connection registered after connect");

    let message = P2PMessage::new_normal(
        *node_a.keypair.public_key(),
        ProtocolCode::HeartbeatV1,
        b"too big for a one-byte global cap".to_vec(),
        &TimeOrderedId128::new(),
    );
    let result = node_a.send_message(&connection, message).await;

    assert!(
        matches!(result, Err(CoreError::Flow(FlowError::Backpressured))),
        "expected Backpressured, got {result:?}"
    );
    assert_eq!(
        connection.send_state.lock().expect("mutex poisoned").len(),
        0,
        "cancelled send must not leave a half-registered send_state entry"
    );
}
