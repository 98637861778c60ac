//! L2: flow and congestion control (§3.6, §4.4).

pub mod congestion;
pub mod global;
pub mod token_bucket;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::MSS_BYTES;
use crate::error::FlowError;
use congestion::CongestionControl;
use global::GlobalFlowControl;
use token_bucket::TokenBucket;

/// Per-connection flow/congestion state plus a handle to the process-wide
/// aggregate (§3.6). `acquireSendPermission` is one of the three allowed
/// suspension points (§5).
pub struct FlowControl {
    bucket: TokenBucket,
    congestion: Mutex<CongestionControl>,
    global: Arc<GlobalFlowControl>,
}

impl FlowControl {
    pub fn new(max_burst: f64, refill_rate_per_sec: f64, global: Arc<GlobalFlowControl>) -> Self {
        Self {
            bucket: TokenBucket::new(max_burst, refill_rate_per_sec),
            congestion: Mutex::new(CongestionControl::new()),
            global,
        }
    }

    /// Acquires permission to send `n` bytes, gated by the token bucket,
    /// this connection's congestion window, and the global aggregate.
    /// Returns `Backpressured` if the deadline elapses first.
    pub async fn acquire_send_permission(&self, n: u32, timeout: Duration) -> Result<(), FlowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let cwnd_ok = {
                let cc = self.congestion.lock().expect("congestion mutex poisoned");
                cc.can_send(n)
            };
            if cwnd_ok && self.global.can_send_globally(n as u64) && self.bucket.try_send(n as f64) {
                {
                    let mut cc = self.congestion.lock().expect("congestion mutex poisoned");
                    cc.on_send(n);
                }
                self.global.on_send(n as u64);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowError::Backpressured);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn on_ack(&self, bytes: u32, rtt: Duration) {
        let mut cc = self.congestion.lock().expect("congestion mutex poisoned");
        cc.on_ack(bytes, rtt);
        drop(cc);
        self.global.on_ack_or_loss(bytes as u64);
    }

    pub fn on_loss(&self, bytes: u32) {
        let mut cc = self.congestion.lock().expect("congestion mutex poisoned");
        cc.on_loss(bytes);
        drop(cc);
        self.global.on_ack_or_loss(bytes as u64);
    }

    pub fn rto(&self) -> Duration {
        self.congestion.lock().expect("congestion mutex poisoned").rto
    }

    pub fn mss(&self) -> u32 {
        MSS_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permission_denied_past_global_cap_surfaces_backpressured() {
        let global = Arc::new(GlobalFlowControl::new(u64::MAX, 10));
        let flow = FlowControl::new(1_000_000.0, 1_000_000.0, global);
        let result = flow
            .acquire_send_permission(1000, Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(FlowError::Backpressured)));
    }

    #[tokio::test]
    async fn permission_granted_when_capacity_available() {
        let global = Arc::new(GlobalFlowControl::new(u64::MAX, u64::MAX));
        let flow = FlowControl::new(1_000_000.0, 1_000_000.0, global);
        let result = flow
            .acquire_send_permission(1000, Duration::from_millis(30))
            .await;
        assert!(result.is_ok());
    }
}
