//! L1 send path: fragmentation, the per-fragment pending table, and
//! retransmit/backoff (§4.3).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{MAX_FRAME_PAYLOAD, RTO_CEILING};

#[derive(Debug, Clone)]
struct PendingFragment {
    payload: Vec<u8>,
    sent_at: Instant,
    retries: u32,
    current_rto: Duration,
}

/// Outcome of a periodic RTO sweep for one message's pending fragments.
pub enum RetransmitOutcome {
    /// Fragment `sequence` should be retransmitted with its RTO doubled
    /// (capped at [`RTO_CEILING`]).
    Retransmit { sequence: u32, payload: Vec<u8> },
    /// `sequence` exceeded [`crate::config::MAX_RETRANSMIT`] retries; the
    /// caller must notify L2 of loss and surface `PeerUnreachable`.
    Abandoned { sequence: u32 },
}

/// Splits an application payload into `MAX_FRAME_PAYLOAD`-sized chunks,
/// the send-side half of §4.3 step 2 ("for each fragment...").
pub fn fragment_payload(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload
        .chunks(MAX_FRAME_PAYLOAD)
        .map(|c| c.to_vec())
        .collect()
}

/// Per-`dataId` send-side bookkeeping: which fragments are still
/// unacknowledged, how many times each has been retried, and the message's
/// current RTO.
pub struct SendState {
    pub data_id: u64,
    pub connection_id: u64,
    pub total: u32,
    pending: HashMap<u32, PendingFragment>,
    delivered: bool,
}

impl SendState {
    pub fn new(connection_id: u64, data_id: u64, total: u32) -> Self {
        Self {
            data_id,
            connection_id,
            total,
            pending: HashMap::new(),
            delivered: false,
        }
    }

    pub fn record_sent(&mut self, sequence: u32, payload: Vec<u8>, initial_rto: Duration) {
        self.pending.insert(
            sequence,
            PendingFragment {
                payload,
                sent_at: Instant::now(),
                retries: 0,
                current_rto: initial_rto,
            },
        );
    }

    /// §4.3 step 3: `DATA_ACK(sequence)` removes the entry and yields the
    /// RTT sample for L2.
    pub fn on_data_ack(&mut self, sequence: u32) -> Option<Duration> {
        self.pending
            .remove(&sequence)
            .map(|fragment| fragment.sent_at.elapsed())
    }

    /// §4.3 step 4: iterate the bitmap and acknowledge each set bit as if
    /// it were a `DATA_ACK`.
    pub fn on_batch_ack(&mut self, bitmap: &[u8], total: u32) -> Vec<Duration> {
        let mut samples = Vec::new();
        for seq in 0..total {
            let byte = (seq / 8) as usize;
            let bit = 7 - (seq % 8);
            if byte < bitmap.len() && bitmap[byte] & (1 << bit) != 0 {
                if let Some(rtt) = self.on_data_ack(seq) {
                    samples.push(rtt);
                }
            }
        }
        samples
    }

    /// §4.3 step 5: `ALL_ACK` clears everything outstanding and marks the
    /// message delivered.
    pub fn on_all_ack(&mut self) {
        self.pending.clear();
        self.delivered = true;
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn outstanding_count(&self) -> usize {
        self.pending.len()
    }

    /// §4.3 step 6: sweep fragments whose RTO has elapsed. Doubles the RTO
    /// (capped) on retransmit; abandons after `max_retransmit` retries.
    pub fn sweep_rto(&mut self, max_retransmit: u32) -> Vec<RetransmitOutcome> {
        let now = Instant::now();
        let mut outcomes = Vec::new();
        let mut to_remove = Vec::new();

        for (&sequence, fragment) in self.pending.iter_mut() {
            if now.duration_since(fragment.sent_at) < fragment.current_rto {
                continue;
            }
            fragment.retries += 1;
            if fragment.retries > max_retransmit {
                outcomes.push(RetransmitOutcome::Abandoned { sequence });
                to_remove.push(sequence);
            } else {
                fragment.current_rto = (fragment.current_rto * 2).min(RTO_CEILING);
                fragment.sent_at = now;
                outcomes.push(RetransmitOutcome::Retransmit {
                    sequence,
                    payload: fragment.payload.clone(),
                });
            }
        }

        for sequence in to_remove {
            self.pending.remove(&sequence);
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_payload_splits_on_mtu_boundary() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD * 2 + 10];
        let fragments = fragment_payload(&payload);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].len(), MAX_FRAME_PAYLOAD);
        assert_eq!(fragments[2].len(), 10);
    }

    #[test]
    fn empty_payload_still_produces_one_fragment() {
        assert_eq!(fragment_payload(&[]).len(), 1);
    }

    #[test]
    fn data_ack_removes_entry_and_yields_rtt() {
        let mut state = SendState::new(1, 2, 4);
        state.record_sent(0, vec![1, 2, 3], Duration::from_millis(100));
        assert_eq!(state.outstanding_count(), 1);
        let rtt = state.on_data_ack(0);
        assert!(rtt.is_some());
        assert_eq!(state.outstanding_count(), 0);
    }

    #[test]
    fn batch_ack_acknowledges_every_set_bit() {
        let mut state = SendState::new(1, 2, 4);
        for seq in 0..4 {
            state.record_sent(seq, vec![seq as u8], Duration::from_millis(100));
        }
        // bits for sequence 0 and 2 set (MSB-first within the byte)
        let bitmap = vec![0b1010_0000];
        let samples = state.on_batch_ack(&bitmap, 4);
        assert_eq!(samples.len(), 2);
        assert_eq!(state.outstanding_count(), 2);
    }

    #[test]
    fn all_ack_clears_everything_and_marks_delivered() {
        let mut state = SendState::new(1, 2, 4);
        state.record_sent(0, vec![1], Duration::from_millis(100));
        state.record_sent(1, vec![2], Duration::from_millis(100));
        state.on_all_ack();
        assert_eq!(state.outstanding_count(), 0);
        assert!(state.is_delivered());
    }

    #[test]
    fn retransmit_budget_is_exact() {
        let mut state = SendState::new(1, 2, 4);
        state.record_sent(0, vec![1], Duration::from_millis(0));
        let mut retransmits = 0;
        loop {
            let outcomes = state.sweep_rto(8);
            if outcomes.is_empty() {
                break;
            }
            match &outcomes[0] {
                RetransmitOutcome::Retransmit { .. } => retransmits += 1,
                RetransmitOutcome::Abandoned { .. } => break,
            }
        }
        assert_eq!(retransmits, 8, "exactly MAX_RETRANSMIT retries, no more no fewer");
    }
}
