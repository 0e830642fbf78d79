//! Connections: one bidirectional channel per peer.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::mem::{Key, KeyCache};
use crate::ring::DescRing;
use crate::transport::RouteId;

/// Fabric-level peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

impl FabricAddr {
    /// Wildcard: matches any peer.
    pub const ANY: FabricAddr = FabricAddr(u64::MAX);

    pub fn is_any(&self) -> bool {
        *self == FabricAddr::ANY
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Index of a connection in its endpoint's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    Shutdown,
}

/// A channel to one peer: its incoming descriptor ring, the transport route
/// for outgoing work, and the cache of keys the peer has exported to us.
pub struct Conn {
    pub id: ConnId,
    pub peer: FabricAddr,
    pub route: RouteId,
    /// Receive-context id stamped into headers sent to this peer.
    pub peer_rx_id: u8,
    state: Mutex<ConnState>,
    pub ring: Mutex<DescRing>,
    pub keys: KeyCache,
    exported: Mutex<HashSet<Key>>,
}

impl Conn {
    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: ConnState) {
        *self.state.lock().unwrap() = s;
    }

    /// Record a local key as exported to this peer. Returns true the first
    /// time, so callers export each key at most once. Revocation does not
    /// clear the record: a revoked key is dead, not re-exportable.
    pub fn export_once(&self, key: Key) -> bool {
        self.exported.lock().unwrap().insert(key)
    }
}

/// Connection table. The mutex is held only while iterating or mutating the
/// map itself, never across slot I/O.
pub struct ConnMap {
    inner: Mutex<Vec<Arc<Conn>>>,
}

impl ConnMap {
    pub fn new() -> ConnMap {
        ConnMap {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn add(
        &self,
        peer: FabricAddr,
        route: RouteId,
        peer_rx_id: u8,
        ring_entries: u32,
    ) -> Arc<Conn> {
        let mut map = self.inner.lock().unwrap();
        let conn = Arc::new(Conn {
            id: ConnId(map.len() as u32),
            peer,
            route,
            peer_rx_id,
            state: Mutex::new(ConnState::Connecting),
            ring: Mutex::new(DescRing::new(ring_entries)),
            keys: KeyCache::new(),
            exported: Mutex::new(HashSet::new()),
        });
        map.push(conn.clone());
        conn
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Conn>> {
        self.inner.lock().unwrap().get(id.0 as usize).cloned()
    }

    /// Clone the table for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Conn>> {
        self.inner.lock().unwrap().clone()
    }
}

impl Default for ConnMap {
    fn default() -> Self {
        Self::new()
    }
}
