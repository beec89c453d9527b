// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use driftshare_core::relay::protocol::RelayPeer;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PeerEntry {
    peer: RelayPeer,
    last_seen_unix: u64,
}

/// Relay-side peer registry: registrations refreshed by heartbeats,
/// silent peers evicted by the sweeper.
#[derive(Debug)]
pub struct RelayPeerRegistry {
    peers: Mutex<HashMap<String, PeerEntry>>,
    timeout: Duration,
}

impl RelayPeerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn register(&self, peer: RelayPeer, now_unix: u64) {
        info!(peer_id = %peer.peer_id, ip = %peer.ip_address, "peer registered");
        self.peers.lock().expect("relay peers poisoned").insert(
            peer.peer_id.clone(),
            PeerEntry {
                peer,
                last_seen_unix: now_unix,
            },
        );
    }

    /// Refresh the liveness clock. Returns false for unknown peers.
    pub fn heartbeat(&self, peer_id: &str, now_unix: u64) -> bool {
        let mut peers = self.peers.lock().expect("relay peers poisoned");
        match peers.get_mut(peer_id) {
            Some(entry) => {
                entry.last_seen_unix = now_unix;
                true
            }
            None => false,
        }
    }

    pub fn list_excluding(&self, exclude_peer_id: Option<&str>) -> Vec<RelayPeer> {
        let peers = self.peers.lock().expect("relay peers poisoned");
        peers
            .values()
            .filter(|entry| Some(entry.peer.peer_id.as_str()) != exclude_peer_id)
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().expect("relay peers poisoned").len()
    }

    pub fn sweep(&self, now_unix: u64) -> usize {
        let cutoff = self.timeout.as_secs();
        let mut peers = self.peers.lock().expect("relay peers poisoned");
        let before = peers.len();
        peers.retain(|peer_id, entry| {
            let keep = now_unix.saturating_sub(entry.last_seen_unix) <= cutoff;
            if !keep {
                debug!(peer_id, "peer timed out");
            }
            keep
        });
        before - peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> RelayPeer {
        RelayPeer {
            peer_id: id.to_owned(),
            display_name: id.to_owned(),
            ip_address: "203.0.113.9".to_owned(),
            port: 9000,
            public_key: "aa".repeat(32),
        }
    }

    #[test]
    fn list_excludes_the_requesting_peer() {
        let registry = RelayPeerRegistry::new(Duration::from_secs(60));
        registry.register(peer("a"), 1_000);
        registry.register(peer("b"), 1_000);

        let listed = registry.list_excluding(Some("a"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].peer_id, "b");
        assert_eq!(registry.list_excluding(None).len(), 2);
    }

    #[test]
    fn heartbeat_refreshes_and_sweep_evicts() {
        let registry = RelayPeerRegistry::new(Duration::from_secs(60));
        registry.register(peer("a"), 1_000);
        registry.register(peer("b"), 1_000);

        assert!(registry.heartbeat("a", 1_050));
        assert!(!registry.heartbeat("ghost", 1_050));

        // b has been silent past the timeout; a heartbeated
        assert_eq!(registry.sweep(1_070), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.list_excluding(None)[0].peer_id, "a");
    }
}
