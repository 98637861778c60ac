//! Request/response correlation via `pendingRequests` (§3.3, §4.6).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::DispatchError;

struct Waiter {
    reply_tx: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<[u8; 16], Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a waiter in `pendingRequests[messageId]` and returns a
    /// receiver that resolves on reply or deadline (§4.6, §8 quantified
    /// invariant: "the waiter is present... in the interval [t,
    /// min(t_reply, d)] and absent outside it").
    pub fn register(&self, message_id: [u8; 16]) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("pending requests mutex poisoned")
            .insert(message_id, Waiter { reply_tx: tx });
        rx
    }

    /// On receiving a message with `reqResFlag=1`, hand the payload to the
    /// waiter keyed by `requestId` and remove the entry; if absent, drop
    /// (§4.6).
    pub fn resolve(&self, request_id: [u8; 16], payload: Vec<u8>) {
        let waiter = self
            .waiters
            .lock()
            .expect("pending requests mutex poisoned")
            .remove(&request_id);
        if let Some(waiter) = waiter {
            let _ = waiter.reply_tx.send(payload);
        }
    }

    /// Removes a waiter without resolving it — used on local cancellation.
    pub fn cancel(&self, message_id: [u8; 16]) {
        self.waiters
            .lock()
            .expect("pending requests mutex poisoned")
            .remove(&message_id);
    }

    /// Drops every outstanding waiter without resolving any of them, so
    /// each one's receiver observes a closed channel. Used when a
    /// connection is torn down (§4.5 drain step) — a response that will
    /// never arrive should not leave its waiter registered forever.
    pub fn cancel_all(&self) {
        self.waiters.lock().expect("pending requests mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("pending requests mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Awaits `receiver` up to `deadline`, removing the waiter from `table`
/// either way and surfacing `RequestTimeout` on expiry (§4.6, §7).
pub async fn await_response(
    table: &PendingRequests,
    message_id: [u8; 16],
    receiver: oneshot::Receiver<Vec<u8>>,
    deadline: Duration,
) -> Result<Vec<u8>, DispatchError> {
    match tokio::time::timeout(deadline, receiver).await {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(_canceled)) => Err(DispatchError::RequestTimeout(message_id)),
        Err(_elapsed) => {
            table.cancel(message_id);
            Err(DispatchError::RequestTimeout(message_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_reply_reaches_the_waiter() {
        let table = PendingRequests::new();
        let message_id = [1u8; 16];
        let rx = table.register(message_id);
        assert_eq!(table.len(), 1);

        table.resolve(message_id, b"pong".to_vec());
        let result = await_response(&table, message_id, rx, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn unmatched_resolve_is_dropped_silently() {
        let table = PendingRequests::new();
        table.resolve([9u8; 16], b"nobody home".to_vec());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn deadline_expiry_surfaces_request_timeout_and_removes_waiter() {
        let table = PendingRequests::new();
        let message_id = [2u8; 16];
        let rx = table.register(message_id);
        let result = await_response(&table, message_id, rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DispatchError::RequestTimeout(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_closes_every_outstanding_waiter() {
        let table = PendingRequests::new();
        let rx_a = table.register([3u8; 16]);
        let rx_b = table.register([4u8; 16]);
        assert_eq!(table.len(), 2);

        table.cancel_all();
        assert!(table.is_empty());
        assert!(await_response(&table, [3u8; 16], rx_a, Duration::from_millis(10))
            .await
            .is_err());
        assert!(await_response(&table, [4u8; 16], rx_b, Duration::from_millis(10))
            .await
            .is_err());
    }
}
