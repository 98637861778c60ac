//! Periodic heartbeat (§4.5): every `T` seconds send PING; PONG replies
//! refresh `lastSeen`. Missed heartbeats do not themselves close the
//! connection — idle eviction (`ConnectionManager::sweep_idle`) does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conn::Connection;
use crate::frame::{Frame, FrameType};

/// Spawns a task that emits a PING frame for `connection` on `interval`
/// until the returned handle is aborted (on connection teardown).
pub fn spawn_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    outbound: mpsc::UnboundedSender<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if connection.current_state() == crate::conn::ConnectionState::Closed {
                break;
            }
            let ping = Frame {
                connection_id: connection.connection_id,
                data_id: 0,
                total: 1,
                frame_type: FrameType::Ping,
                sequence: 0,
                payload: Vec::new(),
                remote_address: Some(connection.remote_address),
            };
            if outbound.send(ping).is_err() {
                break;
            }
        }
    })
}

pub fn pong_frame(connection: &Connection) -> Frame {
    Frame {
        connection_id: connection.connection_id,
        data_id: 0,
        total: 1,
        frame_type: FrameType::Pong,
        sequence: 0,
        payload: Vec::new(),
        remote_address: Some(connection.remote_address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnectionState;
    use crate::flow::global::GlobalFlowControl;
    use crate::flow::FlowControl;
    use crate::message::correlation::PendingRequests;
    use std::sync::Mutex;
    use std::time::Instant;

    fn test_connection() -> Arc<Connection> {
        Arc::new(Connection {
            connection_id: 1,
            node_id: [0u8; 32],
            remote_address: "127.0.0.1:1".parse().unwrap(),
            shared_secret: [0u8; 32],
            last_seen: Mutex::new(Instant::now()),
            state: Mutex::new(ConnectionState::Active),
            flow: Arc::new(FlowControl::new(
                1000.0,
                1000.0,
                Arc::new(GlobalFlowControl::new(u64::MAX, u64::MAX)),
            )),
            pending_requests: PendingRequests::new(),
            send_state: Mutex::new(std::collections::HashMap::new()),
            unreachable: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn heartbeat_emits_ping_on_interval() {
        let conn = test_connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_heartbeat(conn, Duration::from_millis(10), tx);
        let frame = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        handle.abort();
    }
}
