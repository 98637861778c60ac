//! Tuning defaults (§6.7) and the node-wide configuration struct.

use std::net::SocketAddr;
use std::time::Duration;

/// Maximum transmission unit assumed for outbound datagrams.
pub const MTU_BYTES: usize = 1400;
/// Maximum payload carried by a single DATA frame (MTU minus header room).
pub const MAX_FRAME_PAYLOAD: usize = 1336;
/// Frame header size on the wire (§6.1).
pub const FRAME_HEADER_LEN: usize = 29;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const CONNECTION_IDLE_THRESHOLD: Duration = Duration::from_secs(30);
pub const STREAM_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

pub const MAX_RETRANSMIT: u32 = 8;
pub const BATCH_ACK_INTERVAL: u32 = 1024;

pub const INITIAL_CWND_MSS: u32 = 10;
pub const INITIAL_SSTHRESH_MSS: u32 = 64;
pub const MSS_BYTES: u32 = MAX_FRAME_PAYLOAD as u32;

pub const RTO_FLOOR: Duration = Duration::from_millis(100);
pub const RTO_CEILING: Duration = Duration::from_secs(5);

pub const GLOBAL_TARGET_BYTES_PER_SEC: u64 = 15 * 1024 * 1024;
pub const GLOBAL_INFLIGHT_CAP_BYTES: u64 = 15 * 1024 * 1024;

/// Clock-skew tolerance the receive path grants sender timestamps (§8).
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_millis(5);

/// Base component of the per-`dataId` global reassembly timeout.
pub const ASSEMBLY_TIMEOUT_BASE: Duration = Duration::from_millis(500);
/// Per-fragment component of the reassembly timeout (`base + k * total`).
pub const ASSEMBLY_TIMEOUT_PER_FRAGMENT: Duration = Duration::from_millis(2);
pub const ASSEMBLY_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);
pub const ASSEMBLY_TIMEOUT_CEILING: Duration = Duration::from_secs(120);

/// Node-local discriminator bits folded into generated 64-bit ids, so that
/// two nodes started in the same millisecond never collide (§9 Open
/// Question: snowflake bit width is implementation-defined).
pub const fn assembly_timeout_for(total: u32) -> Duration {
    let extra = ASSEMBLY_TIMEOUT_PER_FRAGMENT.as_millis() as u64 * total as u64;
    let raw = ASSEMBLY_TIMEOUT_BASE.as_millis() as u64 + extra;
    let floor = ASSEMBLY_TIMEOUT_FLOOR.as_millis() as u64;
    let ceiling = ASSEMBLY_TIMEOUT_CEILING.as_millis() as u64;
    let clamped = if raw < floor {
        floor
    } else if raw > ceiling {
        ceiling
    } else {
        raw
    };
    Duration::from_millis(clamped)
}

/// Network-wide magic stamped on every handshake record; peers with a
/// different magic are rejected outright, before signature verification.
pub const NETWORK_MAGIC: u32 = 0x4D54_4E31; // "MTN1"
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: std::path::PathBuf,
    pub seeds: Vec<String>,
    pub heartbeat_interval: Duration,
    pub connection_idle_threshold: Duration,
    pub max_retransmit: u32,
    pub batch_ack_interval: u32,
    pub global_target_bytes_per_sec: u64,
    pub global_inflight_cap_bytes: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30303".parse().unwrap(),
            data_dir: std::path::PathBuf::from("."),
            seeds: Vec::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connection_idle_threshold: CONNECTION_IDLE_THRESHOLD,
            max_retransmit: MAX_RETRANSMIT,
            batch_ack_interval: BATCH_ACK_INTERVAL,
            global_target_bytes_per_sec: GLOBAL_TARGET_BYTES_PER_SEC,
            global_inflight_cap_bytes: GLOBAL_INFLIGHT_CAP_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_timeout_respects_floor_and_ceiling() {
        assert_eq!(assembly_timeout_for(0), ASSEMBLY_TIMEOUT_FLOOR);
        assert_eq!(assembly_timeout_for(1_000_000), ASSEMBLY_TIMEOUT_CEILING);
    }

    #[test]
    fn assembly_timeout_grows_with_total() {
        assert!(assembly_timeout_for(5000) > assembly_timeout_for(10));
    }
}
