//! Process-wide flow-control aggregate (§3.6, §4.4, §5), grounded on the
//! teacher's `net::rate_limit::AdaptiveSubnetLimiter` process-wide-limiter
//! shape. Uses lock-free counters with a narrow critical section only for
//! the one-second window reset, per §5's concurrency primitives.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct GlobalFlowControl {
    bytes_in_flight: AtomicI64,
    second_bytes: AtomicU64,
    second_start: Mutex<Instant>,
    target_bytes_per_sec: u64,
    inflight_cap_bytes: u64,
}

impl GlobalFlowControl {
    pub fn new(target_bytes_per_sec: u64, inflight_cap_bytes: u64) -> Self {
        Self {
            bytes_in_flight: AtomicI64::new(0),
            second_bytes: AtomicU64::new(0),
            second_start: Mutex::new(Instant::now()),
            target_bytes_per_sec,
            inflight_cap_bytes,
        }
    }

    fn maybe_reset_window(&self) {
        let mut start = self.second_start.lock().expect("global flow mutex poisoned");
        if start.elapsed() >= Duration::from_secs(1) {
            self.second_bytes.store(0, Ordering::Release);
            *start = Instant::now();
        }
    }

    /// §4.4: fails if either the aggregate in-flight or the current-second
    /// byte counter would exceed its cap.
    pub fn can_send_globally(&self, n: u64) -> bool {
        self.maybe_reset_window();
        let in_flight = self.bytes_in_flight.load(Ordering::Acquire);
        if in_flight < 0 || in_flight as u64 + n > self.inflight_cap_bytes {
            return false;
        }
        let second = self.second_bytes.load(Ordering::Acquire);
        second + n <= self.target_bytes_per_sec
    }

    pub fn on_send(&self, n: u64) {
        self.bytes_in_flight.fetch_add(n as i64, Ordering::AcqRel);
        self.second_bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn on_ack_or_loss(&self, n: u64) {
        self.bytes_in_flight.fetch_sub(n as i64, Ordering::AcqRel);
    }

    pub fn bytes_in_flight(&self) -> i64 {
        self.bytes_in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_send_over_inflight_cap() {
        let global = GlobalFlowControl::new(u64::MAX, 100);
        assert!(global.can_send_globally(100));
        global.on_send(100);
        assert!(!global.can_send_globally(1));
    }

    #[test]
    fn ack_releases_inflight_capacity() {
        let global = GlobalFlowControl::new(u64::MAX, 100);
        global.on_send(100);
        global.on_ack_or_loss(100);
        assert_eq!(global.bytes_in_flight(), 0);
        assert!(global.can_send_globally(100));
    }

    #[test]
    fn rejects_send_over_per_second_target() {
        let global = GlobalFlowControl::new(50, u64::MAX);
        assert!(global.can_send_globally(50));
        global.on_send(50);
        assert!(!global.can_send_globally(1));
    }
}
