//! Wires L0..L4 over a UDP socket: the event loop of §5.
//!
//! A single task owns the inbound socket and fans decoded frames to
//! per-connection channels; each connection's L1 assembly and L4 dispatch
//! then runs single-threaded on its own task, preserving per-`dataId`
//! delivery order while different connections make progress in parallel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::assembly::send::{fragment_payload, RetransmitOutcome, SendState};
use crate::assembly::ReceiveAssembler;
use crate::config::{MTU_BYTES, NodeConfig};
use crate::conn::handshake::{build_initiator_handshake, respond_to_handshake, complete_initiator_handshake};
use crate::conn::heartbeat::spawn_heartbeat;
use crate::conn::manager::ConnectionManager;
use crate::conn::{Connection, ConnectionEvent, ConnectionState};
use crate::crypto::Keypair;
use crate::error::CoreError;
use crate::flow::global::GlobalFlowControl;
use crate::flow::FlowControl;
use crate::frame::{Frame, FrameType};
use crate::ids::{Snowflake64, TimeOrderedId128};
use crate::message::correlation::await_response;
use crate::message::envelope::P2PMessage;
use crate::message::protocol::ProtocolCode;
use crate::message::registry::HandlerRegistry;

/// Per-connection worker state: the single owner of that connection's L1
/// receive-side assembly (§5's "single-owner task with message passing").
/// The send-side pending table lives on [`Connection`] itself since
/// outbound sends can originate from any task holding the `Arc`.
struct ConnWorker {
    receiver: ReceiveAssembler,
}

pub struct Node {
    pub config: NodeConfig,
    pub socket: Arc<UdpSocket>,
    pub keypair: Arc<Keypair>,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<HandlerRegistry>,
    pub global_flow: Arc<GlobalFlowControl>,
    connection_ids: Arc<Snowflake64>,
    data_ids: Arc<Snowflake64>,
    message_ids: Arc<TimeOrderedId128>,
    inbound_channels: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>>,
    /// Outstanding initiator-side handshakes, keyed by the connectionId we
    /// chose in `connect`. The event loop's `handle_connect_resp` resolves
    /// these instead of `connect` reading the socket itself, so the socket
    /// only ever has one reader (§5).
    pending_handshakes: Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>,
}

impl Node {
    pub async fn bind(config: NodeConfig, keypair: Keypair, registry: HandlerRegistry) -> Result<Self, CoreError> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        let discriminator = u64::from_be_bytes(keypair.public_key()[0..8].try_into().unwrap());
        Ok(Self {
            global_flow: Arc::new(GlobalFlowControl::new(
                config.global_target_bytes_per_sec,
                config.global_inflight_cap_bytes,
            )),
            config,
            socket: Arc::new(socket),
            keypair: Arc::new(keypair),
            connections: Arc::new(ConnectionManager::new()),
            registry: Arc::new(registry),
            connection_ids: Arc::new(Snowflake64::new(discriminator)),
            data_ids: Arc::new(Snowflake64::new(discriminator)),
            message_ids: Arc::new(TimeOrderedId128::new()),
            inbound_channels: Arc::new(Mutex::new(HashMap::new())),
            pending_handshakes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Runs the event loop forever. Errors from individual datagrams are
    /// logged and recovered locally, per §7's "nothing here is fatal to the
    /// process."
    pub async fn run(self: Arc<Self>) -> Result<(), CoreError> {
        let idle_threshold = self.config.connection_idle_threshold;
        let connections = self.connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                connections.sweep_idle(idle_threshold);
                connections.evict_closed();
            }
        });

        let mut buf = vec![0u8; MTU_BYTES];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            if let Err(e) = self.clone().on_datagram(&buf[..len], addr).await {
                tracing::warn!(error = %e, peer = %addr, "dropping malformed datagram");
            }
        }
    }

    async fn on_datagram(self: Arc<Self>, bytes: &[u8], addr: SocketAddr) -> Result<(), CoreError> {
        let frame = Frame::decode(bytes, Some(addr))?;
        match frame.frame_type {
            FrameType::ConnectReq => self.handle_connect_req(frame, addr).await,
            FrameType::ConnectResp => self.handle_connect_resp(frame, addr).await,
            _ => self.route_to_connection(frame).await,
        }
    }

    async fn handle_connect_req(self: Arc<Self>, frame: Frame, addr: SocketAddr) -> Result<(), CoreError> {
        let incoming: crate::conn::handshake::NetworkHandshake = match postcard::from_bytes(&frame.payload) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(error = %e, "handshake decode failed");
                return Ok(());
            }
        };

        let (reply, session_key) = match respond_to_handshake(
            &self.keypair,
            crate::config::NODE_VERSION,
            &self.message_ids,
            &incoming,
        ) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "handshake rejected");
                return Ok(());
            }
        };

        // The initiator chooses connectionId at connect time (§3.1); we
        // adopt it rather than minting our own so both sides agree on the
        // key used to route later DATA/ACK frames.
        let connection_id = frame.connection_id;
        let connection = self.spawn_connection(connection_id, incoming.node_id, addr, session_key).await;
        connection.apply(ConnectionEvent::HandshakeSentOrReceived);
        connection.apply(ConnectionEvent::HandshakeCompleted);

        let reply_bytes = postcard::to_allocvec(&reply).map_err(|e| CoreError::Message(
            crate::error::MessageError::Codec(e.to_string()),
        ))?;
        let resp_frame = Frame {
            connection_id,
            data_id: 0,
            total: 1,
            frame_type: FrameType::ConnectResp,
            sequence: 0,
            payload: reply_bytes,
            remote_address: Some(addr),
        };
        self.socket.send_to(&resp_frame.encode(), addr).await?;
        Ok(())
    }

    async fn handle_connect_resp(self: Arc<Self>, frame: Frame, _addr: SocketAddr) -> Result<(), CoreError> {
        let sender = self
            .pending_handshakes
            .lock()
            .await
            .remove(&frame.connection_id);
        if let Some(sender) = sender {
            let _ = sender.send(frame);
        }
        Ok(())
    }

    /// Initiator-side connect: sends CONNECT_REQ and awaits the reply via
    /// the event loop (`handle_connect_resp`), since the event loop is the
    /// socket's only reader once `run` is active (§5).
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<u64, CoreError> {
        let (handshake, ephemeral_secret) =
            build_initiator_handshake(&self.keypair, crate::config::NODE_VERSION, &self.message_ids);
        let connection_id = self.connection_ids.next();
        let payload = postcard::to_allocvec(&handshake)
            .map_err(|e| CoreError::Message(crate::error::MessageError::Codec(e.to_string())))?;
        let req_frame = Frame {
            connection_id,
            data_id: 0,
            total: 1,
            frame_type: FrameType::ConnectReq,
            sequence: 0,
            payload,
            remote_address: Some(addr),
        };

        let (tx, rx) = oneshot::channel();
        self.pending_handshakes.lock().await.insert(connection_id, tx);
        self.socket.send_to(&req_frame.encode(), addr).await?;

        let reply_frame = match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(frame)) => frame,
            _ => {
                self.pending_handshakes.lock().await.remove(&connection_id);
                return Err(CoreError::Conn(crate::error::ConnError::PeerUnreachable));
            }
        };
        let reply: crate::conn::handshake::NetworkHandshake = postcard::from_bytes(&reply_frame.payload)
            .map_err(|e| CoreError::Message(crate::error::MessageError::Codec(e.to_string())))?;

        let session_key = complete_initiator_handshake(ephemeral_secret, &reply)?;
        let connection = self.spawn_connection(connection_id, reply.node_id, addr, session_key).await;
        connection.apply(ConnectionEvent::HandshakeSentOrReceived);
        connection.apply(ConnectionEvent::HandshakeCompleted);
        Ok(connection_id)
    }

    async fn spawn_connection(
        self: &Arc<Self>,
        connection_id: u64,
        node_id: [u8; 32],
        addr: SocketAddr,
        shared_secret: [u8; 32],
    ) -> Arc<Connection> {
        let flow = Arc::new(FlowControl::new(
            64.0 * crate::config::MSS_BYTES as f64,
            crate::config::GLOBAL_TARGET_BYTES_PER_SEC as f64 / 16.0,
            self.global_flow.clone(),
        ));
        let connection = Arc::new(Connection {
            connection_id,
            node_id,
            remote_address: addr,
            shared_secret,
            last_seen: std::sync::Mutex::new(std::time::Instant::now()),
            state: std::sync::Mutex::new(ConnectionState::Init),
            flow,
            pending_requests: crate::message::correlation::PendingRequests::new(),
            send_state: std::sync::Mutex::new(HashMap::new()),
            unreachable: std::sync::atomic::AtomicBool::new(false),
        });
        let _ = self.connections.insert(connection.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound_channels.lock().await.insert(connection_id, tx.clone());
        spawn_heartbeat(connection.clone(), self.config.heartbeat_interval, {
            let socket = self.socket.clone();
            let (hb_tx, mut hb_rx) = mpsc::unbounded_channel::<Frame>();
            tokio::spawn(async move {
                while let Some(frame) = hb_rx.recv().await {
                    let _ = socket.send_to(&frame.encode(), addr).await;
                }
            });
            hb_tx
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.run_connection_worker(connection, rx).await;
        });

        self.connections.get(connection_id).expect("just inserted")
    }

    async fn route_to_connection(&self, frame: Frame) -> Result<(), CoreError> {
        let channels = self.inbound_channels.lock().await;
        if let Some(tx) = channels.get(&frame.connection_id) {
            let _ = tx.send(frame);
        }
        Ok(())
    }

    /// The single-owner per-connection task: runs L1 assembly + L4 dispatch
    /// for one connection's frames, in arrival order (§5).
    async fn run_connection_worker(
        self: Arc<Self>,
        connection: Arc<Connection>,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
    ) {
        let mut worker = ConnWorker {
            receiver: ReceiveAssembler::with_batch_ack_interval(self.config.batch_ack_interval),
        };
        let mut rto_ticker = tokio::time::interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                maybe_frame = inbound.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    connection.touch();
                    self.handle_frame(&connection, &mut worker, frame).await;
                }
                _ = rto_ticker.tick() => {
                    self.sweep_retransmits(&connection).await;
                    for timed_out in worker.receiver.drain_timed_out() {
                        tracing::debug!(
                            data_id = timed_out.data_id,
                            "assembly timed out, dropping partial message"
                        );
                    }
                }
            }
            if connection.current_state() == ConnectionState::Closed {
                break;
            }
        }
    }

    async fn handle_frame(&self, connection: &Arc<Connection>, worker: &mut ConnWorker, frame: Frame) {
        match frame.frame_type {
            FrameType::Data => {
                let data_id = frame.data_id;
                match worker.receiver.on_data_frame(frame) {
                    Ok(outcome) => {
                        for ack in outcome.acks_to_send {
                            let _ = self.socket.send_to(&ack.encode(), connection.remote_address).await;
                        }
                        if let Some(payload) = outcome.delivered {
                            self.deliver_message(connection, payload).await;
                        }
                    }
                    Err(e) => tracing::debug!(data_id, error = %e, "assembly error"),
                }
            }
            FrameType::DataAck => {
                let mut send_state = connection.send_state.lock().expect("send_state mutex poisoned");
                if let Some(state) = send_state.get_mut(&frame.data_id) {
                    if let Some(rtt) = state.on_data_ack(frame.sequence) {
                        connection.flow.on_ack(connection.flow.mss(), rtt);
                    }
                }
            }
            FrameType::BatchAck => {
                let mut send_state = connection.send_state.lock().expect("send_state mutex poisoned");
                if let Some(state) = send_state.get_mut(&frame.data_id) {
                    // BATCH_ACK frames carry total=1 on the wire (Frame::validate's
                    // control-frame invariant); the real fragment count for bitmap
                    // decoding is whatever we recorded when we sent this message.
                    let total = state.total;
                    let samples = state.on_batch_ack(&frame.payload, total);
                    for rtt in samples {
                        connection.flow.on_ack(connection.flow.mss(), rtt);
                    }
                }
            }
            FrameType::AllAck => {
                let mut send_state = connection.send_state.lock().expect("send_state mutex poisoned");
                if let Some(state) = send_state.get_mut(&frame.data_id) {
                    state.on_all_ack();
                }
            }
            FrameType::Ping => {
                let pong = crate::conn::heartbeat::pong_frame(connection);
                let _ = self.socket.send_to(&pong.encode(), connection.remote_address).await;
            }
            FrameType::Pong => {}
            FrameType::Off | FrameType::PeerOff => {
                connection.apply(ConnectionEvent::OffReceived);
                self.close_connection(connection).await;
            }
            FrameType::ConnectReq | FrameType::ConnectResp => {}
        }
    }

    /// Drains a connection already in (or entering) `Closing` and applies
    /// `DrainComplete` (§4.5): cancels outstanding request waiters and
    /// drops the send-side pending table so nothing is left awaiting a
    /// reply or retransmit on a connection that's going away, then evicts
    /// it from the directory and the inbound-routing table. This is the
    /// only call site that ever reaches `Closed` outside of tests.
    async fn close_connection(&self, connection: &Arc<Connection>) {
        connection.pending_requests.cancel_all();
        connection.send_state.lock().expect("send_state mutex poisoned").clear();
        connection.apply(ConnectionEvent::DrainComplete);
        self.inbound_channels.lock().await.remove(&connection.connection_id);
        self.connections.remove(connection.connection_id);
    }

    /// §8 scenario 5: a retransmit sweep abandoning a fragment past its
    /// retry budget means the peer is presumed gone. Surfaces
    /// `PeerUnreachable` to any caller blocked in [`Node::request`] on this
    /// connection and removes it from the directory.
    async fn mark_peer_unreachable(&self, connection: &Arc<Connection>) {
        connection.mark_unreachable();
        connection.apply(ConnectionEvent::LocalShutdown);
        self.close_connection(connection).await;
    }

    async fn sweep_retransmits(&self, connection: &Arc<Connection>) {
        let mut abandoned = Vec::new();
        let mut retransmits = Vec::new();
        {
            let mut send_state = connection.send_state.lock().expect("send_state mutex poisoned");
            for (&data_id, state) in send_state.iter_mut() {
                for outcome in state.sweep_rto(self.config.max_retransmit) {
                    match outcome {
                        RetransmitOutcome::Retransmit { sequence, payload } => {
                            retransmits.push(Frame {
                                connection_id: connection.connection_id,
                                data_id,
                                total: state.total,
                                frame_type: FrameType::Data,
                                sequence,
                                payload,
                                remote_address: Some(connection.remote_address),
                            });
                        }
                        RetransmitOutcome::Abandoned { .. } => {
                            abandoned.push(data_id);
                        }
                    }
                }
            }
            send_state.retain(|_, state| !state.is_delivered());
        }
        for frame in retransmits {
            let _ = self.socket.send_to(&frame.encode(), connection.remote_address).await;
        }
        for _ in &abandoned {
            connection.flow.on_loss(connection.flow.mss());
        }
        if !abandoned.is_empty() {
            tracing::warn!(?abandoned, "retransmit budget exhausted, marking peer unreachable");
            self.mark_peer_unreachable(connection).await;
        }
    }

    async fn deliver_message(&self, connection: &Arc<Connection>, raw_payload: Vec<u8>) {
        let decrypted = match crate::crypto::decrypt_payload(&connection.shared_secret, &raw_payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "payload decryption failed, dropping message");
                return;
            }
        };
        let message = match P2PMessage::decode(&decrypted) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "malformed message, dropping");
                return;
            }
        };

        if message.is_response() {
            connection.pending_requests.resolve(message.request_id, message.payload);
            return;
        }

        match self.registry.dispatch(&message) {
            Ok(Some(response_payload)) => {
                if message.is_request() {
                    let response = P2PMessage::new_response(
                        *self.keypair.public_key(),
                        message.protocol_code().unwrap_or(ProtocolCode::ZeroV1),
                        message.message_id,
                        response_payload,
                        &self.message_ids,
                    );
                    if let Err(e) = self.send_message(connection, response).await {
                        tracing::warn!(error = %e, "failed to send response");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "dispatch failed"),
        }
    }

    /// Sends an already-constructed [`P2PMessage`]: encrypts the payload,
    /// fragments it, acquires send permits per fragment, and registers the
    /// send-side pending table (§4.3, §4.6).
    ///
    /// If a fragment's send permit is denied before its deadline, the send
    /// is cancelled outright (§5 cancellation semantics): the unsent bytes
    /// are credited as loss to L2 and the message's pending table entry is
    /// dropped rather than left half-sent, since the receiver would
    /// otherwise wait forever on a fragment that never arrives.
    pub async fn send_message(&self, connection: &Arc<Connection>, mut message: P2PMessage) -> Result<(), CoreError> {
        let ciphertext = crate::crypto::encrypt_payload(&connection.shared_secret, &message.payload);
        message.payload = ciphertext;
        message.length = message.payload.len() as u32;
        let encoded = message.encode().map_err(CoreError::Message)?;

        let fragments = fragment_payload(&encoded);
        let total = fragments.len() as u32;
        let data_id = self.data_ids.next();

        connection
            .send_state
            .lock()
            .expect("send_state mutex poisoned")
            .insert(data_id, SendState::new(connection.connection_id, data_id, total));

        for (seq, payload) in fragments.into_iter().enumerate() {
            let permit = connection
                .flow
                .acquire_send_permission(payload.len() as u32, Duration::from_secs(2))
                .await;
            if let Err(e) = permit {
                tracing::warn!(data_id, seq, "backpressured, cancelling send");
                connection.flow.on_loss(payload.len() as u32);
                connection
                    .send_state
                    .lock()
                    .expect("send_state mutex poisoned")
                    .remove(&data_id);
                return Err(CoreError::Flow(e));
            }
            let frame = Frame {
                connection_id: connection.connection_id,
                data_id,
                total,
                frame_type: FrameType::Data,
                sequence: seq as u32,
                payload: payload.clone(),
                remote_address: Some(connection.remote_address),
            };
            {
                let mut send_state = connection.send_state.lock().expect("send_state mutex poisoned");
                if let Some(state) = send_state.get_mut(&data_id) {
                    state.record_sent(seq as u32, payload, connection.flow.rto());
                }
            }
            let _ = self.socket.send_to(&frame.encode(), connection.remote_address).await;
        }
        Ok(())
    }

    /// Sends a request and awaits the correlated response (§4.6), one of
    /// the three allowed suspension points (§5).
    pub async fn request(
        &self,
        connection: &Arc<Connection>,
        protocol: ProtocolCode,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, CoreError> {
        let message = P2PMessage::new_request(*self.keypair.public_key(), protocol, payload, &self.message_ids);
        let message_id = message.message_id;
        let rx = connection.pending_requests.register(message_id);
        if let Err(e) = self.send_message(connection, message).await {
            // Cancellation (§5): a send that never went out must not leave
            // its waiter registered behind it.
            connection.pending_requests.cancel(message_id);
            return Err(e);
        }
        match await_response(&connection.pending_requests, message_id, rx, deadline).await {
            Ok(payload) => Ok(payload),
            Err(_) if connection.is_unreachable() => {
                Err(CoreError::Conn(crate::error::ConnError::PeerUnreachable))
            }
            Err(e) => Err(CoreError::Dispatch(e)),
        }
    }
}
