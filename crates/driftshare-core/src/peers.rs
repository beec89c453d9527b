// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::NodeError;
use crate::identity::PeerIdentity;

/// Liveness of a tracked peer.
///
/// `Seen` on a verified Join, `Alive` once the first heartbeat lands,
/// `Stale` after one missed interval, evicted as `Lost` after three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLiveness {
    Seen,
    Alive,
    Stale,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub liveness: PeerLiveness,
    pub last_seen: Instant,
}

/// Outcome of feeding an announcement into the registry, so the discovery
/// service knows which event to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    NewPeer,
    Refreshed,
}

/// The node's view of live peers. `(peer_id, public_key)` is pinned on
/// first contact; an announcement reusing a known id under a different key
/// is rejected.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_join(
        &self,
        identity: PeerIdentity,
        now: Instant,
    ) -> anyhow::Result<RegistryChange> {
        let mut peers = self.peers.lock().expect("peer registry poisoned");
        match peers.get_mut(&identity.peer_id) {
            Some(record) => {
                if record.identity.public_key != identity.public_key {
                    anyhow::bail!(NodeError::permission(format!(
                        "peer {} rejoined with a different key",
                        identity.peer_id
                    )));
                }
                // address may legitimately change between runs on DHCP
                record.identity = identity;
                record.last_seen = now;
                Ok(RegistryChange::Refreshed)
            }
            None => {
                peers.insert(
                    identity.peer_id.clone(),
                    PeerRecord {
                        identity,
                        liveness: PeerLiveness::Seen,
                        last_seen: now,
                    },
                );
                Ok(RegistryChange::NewPeer)
            }
        }
    }

    pub fn observe_heartbeat(
        &self,
        peer_id: &str,
        public_key: &[u8; 32],
        now: Instant,
    ) -> anyhow::Result<RegistryChange> {
        let mut peers = self.peers.lock().expect("peer registry poisoned");
        let Some(record) = peers.get_mut(peer_id) else {
            anyhow::bail!(NodeError::not_found(format!(
                "heartbeat from unknown peer {peer_id}"
            )));
        };
        if &record.identity.public_key != public_key {
            anyhow::bail!(NodeError::permission(format!(
                "heartbeat for {peer_id} signed by a different key"
            )));
        }
        record.last_seen = now;
        record.liveness = PeerLiveness::Alive;
        Ok(RegistryChange::Refreshed)
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerIdentity> {
        let mut peers = self.peers.lock().expect("peer registry poisoned");
        peers.remove(peer_id).map(|record| record.identity)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        let peers = self.peers.lock().expect("peer registry poisoned");
        peers.get(peer_id).cloned()
    }

    pub fn pinned_key(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.get(peer_id).map(|record| record.identity.public_key)
    }

    /// Peers eligible for fan-out: everything still tracked, including
    /// `Stale` entries that have not yet missed three intervals.
    pub fn known_peers(&self) -> Vec<PeerIdentity> {
        let peers = self.peers.lock().expect("peer registry poisoned");
        peers
            .values()
            .map(|record| record.identity.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer registry poisoned").len()
    }

    /// Advance liveness: one missed heartbeat interval demotes to
    /// `Stale`; silence past `peer_timeout` (three intervals by default)
    /// evicts. Returns the evicted identities so the caller can fire
    /// `PeerLost`.
    pub fn sweep(
        &self,
        now: Instant,
        heartbeat_interval: Duration,
        peer_timeout: Duration,
    ) -> Vec<PeerIdentity> {
        let mut peers = self.peers.lock().expect("peer registry poisoned");
        let mut lost = Vec::new();
        peers.retain(|_, record| {
            let silent_for = now.saturating_duration_since(record.last_seen);
            if silent_for >= peer_timeout {
                lost.push(record.identity.clone());
                return false;
            }
            if silent_for >= heartbeat_interval && record.liveness == PeerLiveness::Alive {
                record.liveness = PeerLiveness::Stale;
            }
            true
        });
        lost
    }
}
