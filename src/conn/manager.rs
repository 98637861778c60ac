//! Peer directory, ban list, and netgroup diversity caps (§4.5), grounded
//! on `montana::net::connection::{ConnectionManager, BanList, BanEntry,
//! get_netgroup}`.

use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::conn::{Connection, ConnectionEvent};
use crate::error::ConnError;

/// Groups an address into a coarse netgroup (the /16 for IPv4, the /32 for
/// IPv6) for connection-diversity accounting, mirroring the teacher's own
/// netgroup bucketing used to cap same-subnet connection counts.
pub fn get_netgroup(addr: &IpAddr) -> u64 {
    let key: Vec<u8> = match addr {
        IpAddr::V4(v4) => v4.octets()[0..2].to_vec(),
        IpAddr::V6(v6) => v6.octets()[0..4].to_vec(),
    };
    let mut hasher = SipHasher13::new();
    hasher.write(&key);
    hasher.finish()
}

pub const MAX_CONNECTIONS_PER_NETGROUP: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub node_id: [u8; 32],
    pub reason: String,
    #[serde(with = "duration_secs")]
    pub banned_at: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Persisted ban list, bincode-serialized, guarded against oversized files
/// before deserialization — the same discipline the teacher's `BanList`
/// applies to its on-disk form.
#[derive(Default)]
pub struct BanList {
    entries: Mutex<HashMap<[u8; 32], BanEntry>>,
}

const MAX_BAN_FILE_BYTES: u64 = 16 * 1024 * 1024;

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&self, node_id: [u8; 32], reason: &str, now_secs: u64) {
        let mut entries = self.entries.lock().expect("ban list mutex poisoned");
        entries.insert(
            node_id,
            BanEntry {
                node_id,
                reason: reason.to_string(),
                banned_at: Duration::from_secs(now_secs),
            },
        );
    }

    pub fn is_banned(&self, node_id: &[u8; 32]) -> bool {
        self.entries
            .lock()
            .expect("ban list mutex poisoned")
            .contains_key(node_id)
    }

    pub fn load_from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if metadata.len() > MAX_BAN_FILE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ban list file exceeds maximum size",
            ));
        }
        let bytes = std::fs::read(path)?;
        let decoded: Vec<BanEntry> = bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut map = HashMap::new();
        for entry in decoded {
            map.insert(entry.node_id, entry);
        }
        Ok(Self {
            entries: Mutex::new(map),
        })
    }

    /// Merges entries from `path` into this (already-constructed) ban list,
    /// for loading a persisted list into a `ConnectionManager` that's shared
    /// behind an `Arc` and so can't be replaced wholesale.
    pub fn load_into(&self, path: &std::path::Path) -> std::io::Result<()> {
        let loaded = Self::load_from_file(path)?;
        let mut entries = self.entries.lock().expect("ban list mutex poisoned");
        entries.extend(loaded.entries.into_inner().expect("ban list mutex poisoned"));
        Ok(())
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        let entries: Vec<BanEntry> = self
            .entries
            .lock()
            .expect("ban list mutex poisoned")
            .values()
            .cloned()
            .collect();
        let bytes =
            bincode::serialize(&entries).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, bytes)
    }
}

/// Peer directory: `connectionId -> Connection`, plus the ban list and
/// netgroup diversity cap (§4.5's "address <-> connection mapping",
/// enriched per SPEC_FULL.md §1.2).
pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    netgroup_counts: Mutex<HashMap<u64, usize>>,
    pub bans: BanList,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            netgroup_counts: Mutex::new(HashMap::new()),
            bans: BanList::new(),
        }
    }

    pub fn insert(&self, connection: Arc<Connection>) -> Result<(), ConnError> {
        if self.bans.is_banned(&connection.node_id) {
            return Err(ConnError::HandshakeRejected("peer is banned"));
        }
        let netgroup = get_netgroup(&connection.remote_address.ip());
        {
            let mut counts = self.netgroup_counts.lock().expect("netgroup mutex poisoned");
            let count = counts.entry(netgroup).or_insert(0);
            if *count >= MAX_CONNECTIONS_PER_NETGROUP {
                return Err(ConnError::HandshakeRejected(
                    "too many connections from this netgroup",
                ));
            }
            *count += 1;
        }
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(connection.connection_id, connection);
        Ok(())
    }

    pub fn get(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .get(&connection_id)
            .cloned()
    }

    pub fn find_by_address(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .values()
            .find(|c| c.remote_address == addr)
            .cloned()
    }

    pub fn remove(&self, connection_id: u64) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .remove(&connection_id);
        if let Some(conn) = &removed {
            let netgroup = get_netgroup(&conn.remote_address.ip());
            let mut counts = self.netgroup_counts.lock().expect("netgroup mutex poisoned");
            if let Some(count) = counts.get_mut(&netgroup) {
                *count = count.saturating_sub(1);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.lock().expect("connections mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps the directory for connections idle beyond `threshold` and
    /// applies the `IDLE`/`ACTIVE` transition (§4.5).
    pub fn sweep_idle(&self, threshold: Duration) {
        let connections = self.connections.lock().expect("connections mutex poisoned");
        for conn in connections.values() {
            if conn.idle_for() > threshold {
                conn.apply(ConnectionEvent::IdleTimeoutElapsed);
            }
        }
    }

    pub fn evict_closed(&self) -> Vec<u64> {
        let mut connections = self.connections.lock().expect("connections mutex poisoned");
        let closed: Vec<u64> = connections
            .iter()
            .filter(|(_, c)| c.current_state() == crate::conn::ConnectionState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            connections.remove(id);
        }
        closed
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netgroup_buckets_adjacent_v4_addresses_together() {
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.200.9".parse().unwrap();
        let c: IpAddr = "198.51.100.1".parse().unwrap();
        assert_eq!(get_netgroup(&a), get_netgroup(&b));
        assert_ne!(get_netgroup(&a), get_netgroup(&c));
    }

    #[test]
    fn ban_list_blocks_known_node_id() {
        let bans = BanList::new();
        let node_id = [4u8; 32];
        assert!(!bans.is_banned(&node_id));
        bans.ban(node_id, "handshake rejected repeatedly", 0);
        assert!(bans.is_banned(&node_id));
    }

    #[test]
    fn ban_list_round_trips_through_file() {
        let bans = BanList::new();
        bans.ban([9u8; 32], "test", 100);
        let dir = std::env::temp_dir().join(format!("quicnet-banlist-test-{}", std::process::id()));
        bans.save_to_file(&dir).unwrap();
        let reloaded = BanList::load_from_file(&dir).unwrap();
        assert!(reloaded.is_banned(&[9u8; 32]));
        let _ = std::fs::remove_file(&dir);
    }
}
