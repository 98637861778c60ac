//! Identifier generators (§6.6, GLOSSARY, §9 Open Questions).
//!
//! Two distinct schemes are used on purpose:
//! - [`Snowflake64`] for `connectionId`/`dataId`: node-local, monotonic,
//!   64 bits. Bit layout is implementation-defined per the spec; this one
//!   uses 41 timestamp-ms bits / 10 discriminator bits / 12 sequence bits,
//!   the classic Twitter-snowflake split, which gives 4096 ids per
//!   millisecond per node without depending on sub-millisecond clock
//!   resolution.
//! - [`TimeOrderedId128`] for `messageId` (and handshake `nonceId`): 128
//!   bits, high 48 bits Unix-ms timestamp, a fixed version nibble, and the
//!   remainder cryptographically random, disambiguated by a monotonic
//!   counter within the same millisecond.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use rand::RngCore;

const TIMESTAMP_BITS: u32 = 41;
const DISCRIMINATOR_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const DISCRIMINATOR_MASK: u64 = (1 << DISCRIMINATOR_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Node-local monotonic 64-bit id generator used for both `connectionId`
/// and `dataId` (the spec treats them as the same kind of snowflake,
/// scoped by purpose rather than by layout).
pub struct Snowflake64 {
    discriminator: u64,
    last_millis: AtomicU64,
    sequence: AtomicU16,
}

impl Snowflake64 {
    /// `discriminator` should be stable for the process's lifetime (e.g.
    /// derived from the node's public key) so that ids generated before
    /// and after a restart in the same millisecond still cannot collide
    /// with another node's.
    pub fn new(discriminator: u64) -> Self {
        Self {
            discriminator: discriminator & DISCRIMINATOR_MASK,
            last_millis: AtomicU64::new(0),
            sequence: AtomicU16::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let now = now_millis() & MAX_TIMESTAMP;
        let prev = self.last_millis.swap(now, Ordering::AcqRel);
        let seq = if prev == now {
            self.sequence.fetch_add(1, Ordering::AcqRel) as u64 & SEQUENCE_MASK
        } else {
            self.sequence.store(0, Ordering::Release);
            0
        };
        (now << (DISCRIMINATOR_BITS + SEQUENCE_BITS))
            | (self.discriminator << SEQUENCE_BITS)
            | seq
    }
}

/// 128-bit time-ordered identifier (§6.6): high 48 bits Unix-ms timestamp,
/// bits 48..51 a fixed version nibble (7), bits 52..127 random, with a
/// monotonic counter folded into the low random bits to disambiguate
/// same-millisecond issuances from this process.
pub struct TimeOrderedId128 {
    counter: AtomicU16,
}

const VERSION_NIBBLE: u8 = 7;

impl TimeOrderedId128 {
    pub fn new() -> Self {
        Self {
            counter: AtomicU16::new(0),
        }
    }

    pub fn next(&self) -> [u8; 16] {
        let ts = now_millis() & ((1u64 << 48) - 1);
        let mut out = [0u8; 16];
        out[0..6].copy_from_slice(&ts.to_be_bytes()[2..8]);

        let mut rand_tail = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut rand_tail);
        out[6..16].copy_from_slice(&rand_tail);

        // version nibble occupies the top nibble of byte 6
        out[6] = (out[6] & 0x0F) | (VERSION_NIBBLE << 4);

        // fold a monotonic counter into the low 16 bits so that two ids
        // minted in the same millisecond from this process never collide
        // even in the (astronomically unlikely) case of a random tie.
        let c = self.counter.fetch_add(1, Ordering::AcqRel);
        out[14] ^= (c >> 8) as u8;
        out[15] ^= (c & 0xFF) as u8;
        out
    }
}

impl Default for TimeOrderedId128 {
    fn default() -> Self {
        Self::new()
    }
}

pub fn zero_id() -> [u8; 16] {
    [0u8; 16]
}

pub fn is_zero_id(id: &[u8; 16]) -> bool {
    id.iter().all(|b| *b == 0)
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn snowflake_ids_are_monotonic_and_unique() {
        let gen = Snowflake64::new(3);
        let mut seen = HashSet::new();
        let mut prev = 0;
        for _ in 0..5000 {
            let id = gen.next();
            assert!(id > prev || seen.is_empty());
            assert!(seen.insert(id), "duplicate snowflake id");
            prev = id;
        }
    }

    #[test]
    fn time_ordered_ids_carry_version_nibble() {
        let gen = TimeOrderedId128::new();
        let id = gen.next();
        assert_eq!((id[6] >> 4) & 0x0F, VERSION_NIBBLE);
    }

    #[test]
    fn time_ordered_ids_are_unique_within_same_millisecond() {
        let gen = TimeOrderedId128::new();
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            assert!(seen.insert(gen.next()));
        }
    }

    #[test]
    fn zero_id_helpers_agree() {
        assert!(is_zero_id(&zero_id()));
        let gen = TimeOrderedId128::new();
        assert!(!is_zero_id(&gen.next()));
    }
}
