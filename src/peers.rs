//! Peer registry: name -> socket address (spec §3 Peer, §9 design note).
//!
//! Deliberately a small concurrent map keyed by stable name strings rather
//! than by address — consumers (and the server façade) always refer to a
//! peer by name, the same way `imbolc-net`'s client/server code refers to
//! clients by `ClientId` rather than raw sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// The engine's default control-port peer name.
pub const ENGINE: &str = "engine";
/// The optional language-interpreter peer name.
pub const INTERPRETER: &str = "interpreter";

/// A name -> address registry guarded by a short-lived `RwLock` (reads vastly
/// outnumber registrations, which only happen at startup/config time).
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, SocketAddr>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, addr: SocketAddr) {
        self.peers.write().unwrap().insert(name.into(), addr);
    }

    pub fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.peers.read().unwrap().get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
