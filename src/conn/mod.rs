//! L3: connection manager (§3.3, §4.5).

pub mod handshake;
pub mod heartbeat;
pub mod manager;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::flow::FlowControl;
use crate::message::correlation::PendingRequests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Handshaking,
    Active,
    Idle,
    Closing,
    Closed,
}

impl ConnectionState {
    /// §4.5 state machine transitions. Returns `None` for a transition the
    /// spec does not define from the current state.
    pub fn on_event(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (Init, HandshakeSentOrReceived) => Some(Handshaking),
            (Handshaking, HandshakeCompleted) => Some(Active),
            (Active, IdleTimeoutElapsed) => Some(Idle),
            (Idle, ValidInboundFrame) => Some(Active),
            (Active, ValidInboundFrame) => Some(Active),
            (_, OffReceived) => Some(Closing),
            (_, LocalShutdown) => Some(Closing),
            (Closing, DrainComplete) => Some(Closed),
            _ => None,
        }
    }
}

pub enum ConnectionEvent {
    HandshakeSentOrReceived,
    HandshakeCompleted,
    IdleTimeoutElapsed,
    ValidInboundFrame,
    OffReceived,
    LocalShutdown,
    DrainComplete,
}

/// One peer connection (§3.3). Owns its flow controller; holds no pointer
/// back from the flow controller to itself, avoiding the cyclic reference
/// the spec's design notes call out.
pub struct Connection {
    pub connection_id: u64,
    pub node_id: [u8; 32],
    pub remote_address: SocketAddr,
    pub shared_secret: [u8; 32],
    pub last_seen: std::sync::Mutex<Instant>,
    pub state: std::sync::Mutex<ConnectionState>,
    pub flow: Arc<FlowControl>,
    pub pending_requests: PendingRequests,
    /// Send-side pending table, keyed by `dataId` (§3.2, §4.3). Shared like
    /// `pending_requests` rather than owned by the per-connection inbound
    /// worker, since outbound sends originate from whichever task calls
    /// `Node::send_message`, not from the inbound frame loop.
    pub send_state: std::sync::Mutex<std::collections::HashMap<u64, crate::assembly::send::SendState>>,
    /// Set once a retransmit sweep abandons a fragment past its retry
    /// budget (§8 scenario 5); lets callers blocked in [`Node::request`]
    /// distinguish "peer went silent" from an ordinary response timeout.
    pub(crate) unreachable: AtomicBool,
}

impl Connection {
    pub fn mark_unreachable(&self) {
        self.unreachable.store(true, Ordering::Release);
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen mutex poisoned") = Instant::now();
        let mut state = self.state.lock().expect("state mutex poisoned");
        if let Some(next) = state.on_event(ConnectionEvent::ValidInboundFrame) {
            *state = next;
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().expect("last_seen mutex poisoned").elapsed()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.lock().expect("state mutex poisoned")
    }

    pub fn apply(&self, event: ConnectionEvent) -> bool {
        let mut state = self.state.lock().expect("state mutex poisoned");
        match state.on_event(event) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        }
    }
}
