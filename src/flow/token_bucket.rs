//! Token-bucket rate limiter (§3.6, §4.4), structurally grounded on the
//! teacher's `net::rate_limit::TokenBucket`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    max_burst: f64,
    refill_rate_per_sec: f64,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(max_burst: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            max_burst,
            refill_rate_per_sec,
            inner: Mutex::new(Inner {
                tokens: max_burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, inner: &mut Inner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate_per_sec).min(self.max_burst);
        inner.last_refill = now;
    }

    /// Refills by elapsed time, clamps to `maxBurst`, then atomically
    /// subtracts `n` if available (§4.4).
    pub fn try_send(&self, n: f64) -> bool {
        let mut inner = self.inner.lock().expect("token bucket mutex poisoned");
        self.refill(&mut inner);
        if inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        let mut inner = self.inner.lock().expect("token bucket mutex poisoned");
        self.refill(&mut inner);
        inner.tokens
    }

    /// Loops `try_send` with bounded sleep, respecting the deadline. One of
    /// the three suspension points allowed by §5.
    pub async fn acquire(&self, n: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_send(n) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
