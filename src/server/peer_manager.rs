//! Hostname → peer registry
//!
//! Hostnames are unique across live peers. Registration is atomic with
//! eviction: a newer authenticated session takes over its hostnames, and a
//! prior owner left with none is closed. All map mutation serializes on
//! one lock; peers are closed only after it is released.

use super::Peer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Default)]
struct Tables {
    by_hostname: HashMap<String, Arc<Peer>>,
    by_identity: HashMap<[u8; 32], Arc<Peer>>,
}

/// Registry of live peers, keyed by hostname and by identity
#[derive(Default)]
pub struct PeerManager {
    tables: Mutex<Tables>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly authenticated peer, evicting prior owners of its
    /// hostnames and any prior session with the same identity
    pub async fn register(&self, peer: Arc<Peer>) {
        let mut evicted: Vec<Arc<Peer>> = Vec::new();
        {
            let mut tables = self.tables.lock().unwrap();

            if let Some(prior) = tables.by_identity.remove(peer.identity()) {
                tables.by_hostname.retain(|_, p| !Arc::ptr_eq(p, &prior));
                evicted.push(prior);
            }

            for hostname in peer.hostnames() {
                if let Some(prior) = tables.by_hostname.insert(hostname.clone(), Arc::clone(&peer))
                {
                    if Arc::ptr_eq(&prior, &peer) {
                        continue;
                    }
                    let still_owns = tables
                        .by_hostname
                        .values()
                        .any(|p| Arc::ptr_eq(p, &prior));
                    if !still_owns && !evicted.iter().any(|p| Arc::ptr_eq(p, &prior)) {
                        tables.by_identity.retain(|_, p| !Arc::ptr_eq(p, &prior));
                        evicted.push(prior);
                    }
                }
            }

            tables.by_identity.insert(*peer.identity(), Arc::clone(&peer));
        }

        info!(hostnames = ?peer.hostnames(), "Peer registered");
        for prior in evicted {
            debug!(hostnames = ?prior.hostnames(), "Evicting superseded peer");
            prior.close().await;
        }
    }

    /// Drop a dead peer's entries; a newer session that already took a
    /// hostname over is left untouched
    pub fn remove(&self, peer: &Arc<Peer>) {
        let mut tables = self.tables.lock().unwrap();
        tables.by_hostname.retain(|_, p| !Arc::ptr_eq(p, peer));
        if let Some(current) = tables.by_identity.get(peer.identity()) {
            if Arc::ptr_eq(current, peer) {
                tables.by_identity.remove(peer.identity());
            }
        }
    }

    /// Look up the peer owning `hostname` (case-insensitive)
    pub fn get_by_hostname(&self, hostname: &str) -> Option<Arc<Peer>> {
        let hostname = hostname.to_ascii_lowercase();
        self.tables.lock().unwrap().by_hostname.get(&hostname).cloned()
    }

    /// Number of live peer sessions
    pub fn connections(&self) -> usize {
        self.tables.lock().unwrap().by_identity.len()
    }
}
