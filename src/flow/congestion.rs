//! CUBIC-style congestion window and RTT estimation (§3.6, §4.4).

use std::time::Duration;

use crate::config::{INITIAL_CWND_MSS, INITIAL_SSTHRESH_MSS, MSS_BYTES, RTO_CEILING, RTO_FLOOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    Avoidance,
    Recovery,
}

const LOSS_BETA: f64 = 0.7;
const MIN_CWND_BYTES: u32 = MSS_BYTES;
const RTT_ALPHA: f64 = 1.0 / 8.0;
const RTT_BETA: f64 = 1.0 / 4.0;

pub struct CongestionControl {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub bytes_in_flight: u32,
    smoothed_rtt: Option<Duration>,
    rtt_var: Duration,
    pub rto: Duration,
    pub phase: Phase,
}

impl CongestionControl {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND_MSS * MSS_BYTES,
            ssthresh: INITIAL_SSTHRESH_MSS * MSS_BYTES,
            bytes_in_flight: 0,
            smoothed_rtt: None,
            rtt_var: Duration::from_millis(0),
            rto: RTO_FLOOR,
            phase: Phase::SlowStart,
        }
    }

    pub fn can_send(&self, n: u32) -> bool {
        self.bytes_in_flight + n <= self.cwnd
    }

    pub fn on_send(&mut self, n: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(n);
    }

    /// §4.4: on ACK of `b` bytes with RTT `r`, update RTT estimate, RTO, and
    /// grow the window according to the current phase.
    pub fn on_ack(&mut self, bytes: u32, rtt: Duration) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        self.update_rtt(rtt);

        match self.phase {
            Phase::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(bytes);
                if self.cwnd >= self.ssthresh {
                    self.phase = Phase::Avoidance;
                }
            }
            Phase::Avoidance => {
                let growth = ((bytes as u64 * MSS_BYTES as u64) / self.cwnd.max(1) as u64) as u32;
                self.cwnd = self.cwnd.saturating_add(growth.max(1));
            }
            Phase::Recovery => {
                self.phase = Phase::Avoidance;
            }
        }
    }

    /// §4.4: on loss of `b` bytes, halve-ish the window and enter recovery.
    pub fn on_loss(&mut self, bytes: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        self.ssthresh = ((self.cwnd as f64 * LOSS_BETA) as u32).max(MIN_CWND_BYTES);
        self.cwnd = self.ssthresh;
        self.phase = Phase::Recovery;
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(sample);
                self.rtt_var = sample / 2;
            }
            Some(srtt) => {
                let diff = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.rtt_var = duration_ewma(self.rtt_var, diff, RTT_BETA);
                self.smoothed_rtt = Some(duration_ewma(srtt, sample, RTT_ALPHA));
            }
        }
        let srtt = self.smoothed_rtt.unwrap_or(sample);
        let candidate = srtt + self.rtt_var * 4;
        self.rto = candidate.clamp(RTO_FLOOR, RTO_CEILING);
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }
}

impl Default for CongestionControl {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ewma(current: Duration, sample: Duration, alpha: f64) -> Duration {
    let current_ns = current.as_nanos() as f64;
    let sample_ns = sample.as_nanos() as f64;
    let blended = current_ns * (1.0 - alpha) + sample_ns * alpha;
    Duration::from_nanos(blended.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_transitions_to_avoidance_at_ssthresh() {
        let mut cc = CongestionControl::new();
        while cc.phase == Phase::SlowStart {
            cc.on_send(MSS_BYTES);
            cc.on_ack(MSS_BYTES, Duration::from_millis(50));
        }
        assert_eq!(cc.phase, Phase::Avoidance);
        assert!(cc.cwnd >= cc.ssthresh);
    }

    #[test]
    fn loss_drops_cwnd_to_beta_fraction_and_enters_recovery() {
        let mut cc = CongestionControl::new();
        let cwnd_before = cc.cwnd;
        cc.on_send(1000);
        cc.on_loss(1000);
        assert_eq!(cc.phase, Phase::Recovery);
        assert!(cc.cwnd < cwnd_before);
        assert_eq!(cc.cwnd, cc.ssthresh);
    }

    #[test]
    fn rto_is_clamped_between_floor_and_ceiling() {
        let mut cc = CongestionControl::new();
        cc.on_ack(100, Duration::from_millis(1));
        assert!(cc.rto >= RTO_FLOOR);
        cc.on_ack(100, Duration::from_secs(30));
        assert!(cc.rto <= RTO_CEILING);
    }

    #[test]
    fn bytes_in_flight_never_goes_negative() {
        let mut cc = CongestionControl::new();
        cc.on_ack(1_000_000, Duration::from_millis(10));
        assert_eq!(cc.bytes_in_flight, 0);
    }
}
