// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::{EventBus, NodeEvent};
use crate::identity::PeerIdentity;
use crate::peers::{PeerRegistry, RegistryChange};
use crate::security::SecurityContext;
use crate::transport::now_unix_secs;

const MAX_DATAGRAM_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementKind {
    Join,
    Heartbeat,
    Leave,
}

impl AnnouncementKind {
    fn code(self) -> u8 {
        match self {
            Self::Join => 0,
            Self::Heartbeat => 1,
            Self::Leave => 2,
        }
    }
}

/// A signed discovery datagram. Verification uses the embedded key on
/// first contact and the pinned key thereafter; a mismatch drops the
/// datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub kind: AnnouncementKind,
    pub identity: PeerIdentity,
    pub timestamp_unix_secs: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct AnnouncementSigningTuple<'a>(u8, &'a PeerIdentity, u64);

impl Announcement {
    pub fn signed(
        kind: AnnouncementKind,
        identity: &PeerIdentity,
        security: &SecurityContext,
    ) -> anyhow::Result<Self> {
        let timestamp = now_unix_secs()?;
        let signable =
            serde_cbor::to_vec(&AnnouncementSigningTuple(kind.code(), identity, timestamp))?;
        Ok(Self {
            kind,
            identity: identity.clone(),
            timestamp_unix_secs: timestamp,
            signature: security.sign(&signable).to_vec(),
        })
    }

    /// `pinned_key` wins over the embedded key when the peer is known.
    pub fn verify(&self, pinned_key: Option<[u8; 32]>) -> anyhow::Result<()> {
        let key = pinned_key.unwrap_or(self.identity.public_key);
        let signable = serde_cbor::to_vec(&AnnouncementSigningTuple(
            self.kind.code(),
            &self.identity,
            self.timestamp_unix_secs,
        ))?;
        SecurityContext::verify(&signable, &self.signature, &key)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub bind_addr: SocketAddr,
    /// Broadcast target on the LAN profile; a unicast address in tests.
    pub announce_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
}

impl DiscoverySettings {
    pub fn lan(discovery_port: u16, heartbeat_interval: Duration, peer_timeout: Duration) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], discovery_port)),
            announce_addr: SocketAddr::from(([255, 255, 255, 255], discovery_port)),
            heartbeat_interval,
            peer_timeout,
        }
    }
}

/// Broadcast peer discovery: announce on start, heartbeat on a fixed
/// timer, evict silent peers, and translate registry changes into node
/// events.
pub struct DiscoveryService {
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    settings: DiscoverySettings,
}

pub struct DiscoveryHandle {
    shutdown: watch::Sender<bool>,
    recv_task: tokio::task::JoinHandle<()>,
    beat_task: tokio::task::JoinHandle<()>,
    socket: Arc<UdpSocket>,
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    announce_addr: SocketAddr,
}

impl DiscoveryService {
    pub fn new(
        security: Arc<SecurityContext>,
        local: PeerIdentity,
        registry: Arc<PeerRegistry>,
        events: EventBus,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            security,
            local,
            registry,
            events,
            settings,
        }
    }

    /// Bind the discovery socket, emit the Join announcement, and start
    /// the receive and heartbeat loops.
    pub async fn spawn(self) -> anyhow::Result<DiscoveryHandle> {
        let socket = UdpSocket::bind(self.settings.bind_addr).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let join = Announcement::signed(AnnouncementKind::Join, &self.local, &self.security)?;
        send_announcement(&socket, &join, self.settings.announce_addr).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        let recv_task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&self.security),
            self.local.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
            shutdown_rx.clone(),
        ));

        let beat_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&socket),
            Arc::clone(&self.security),
            self.local.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
            self.settings.clone(),
            shutdown_rx,
        ));

        Ok(DiscoveryHandle {
            shutdown,
            recv_task,
            beat_task,
            socket,
            security: self.security,
            local: self.local,
            announce_addr: self.settings.announce_addr,
        })
    }
}

impl DiscoveryHandle {
    /// Announce Leave so peers evict immediately, then stop both loops.
    pub async fn shutdown(self) {
        if let Ok(leave) = Announcement::signed(AnnouncementKind::Leave, &self.local, &self.security)
        {
            let _ = send_announcement(&self.socket, &leave, self.announce_addr).await;
        }
        let _ = self.shutdown.send(true);
        let _ = self.beat_task.await;
        self.recv_task.abort();
        let _ = self.recv_task.await;
    }
}

async fn send_announcement(
    socket: &UdpSocket,
    announcement: &Announcement,
    target: SocketAddr,
) -> anyhow::Result<()> {
    let bytes = serde_cbor::to_vec(announcement)?;
    socket.send_to(&bytes, target).await?;
    Ok(())
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "discovery socket receive failed");
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let announcement: Announcement = match serde_cbor::from_slice(&buf[..len]) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%from, error = %err, "dropping malformed discovery datagram");
                continue;
            }
        };
        if announcement.identity.peer_id == local.peer_id {
            continue; // our own broadcast reflected back
        }

        if let Err(err) = handle_announcement(
            &announcement,
            &registry,
            &events,
            Instant::now(),
        ) {
            warn!(
                peer = %announcement.identity.peer_id,
                error = %err,
                "dropping discovery announcement"
            );
            continue;
        }

        // Answer a newcomer's Join with a unicast Join of our own so it
        // learns us before our next scheduled heartbeat.
        if announcement.kind == AnnouncementKind::Join {
            if let Ok(reply) = Announcement::signed(AnnouncementKind::Join, &local, &security) {
                let _ = send_announcement(&socket, &reply, from).await;
            }
        }
    }
}

/// Verify and apply one announcement. Pure with respect to sockets, so
/// the protocol rules are testable without the network.
pub fn handle_announcement(
    announcement: &Announcement,
    registry: &PeerRegistry,
    events: &EventBus,
    now: Instant,
) -> anyhow::Result<()> {
    let pinned = registry.pinned_key(&announcement.identity.peer_id);
    announcement.verify(pinned)?;

    match announcement.kind {
        AnnouncementKind::Join => {
            if registry.observe_join(announcement.identity.clone(), now)?
                == RegistryChange::NewPeer
            {
                events.emit(NodeEvent::PeerDiscovered(announcement.identity.clone()));
            }
        }
        AnnouncementKind::Heartbeat => {
            // a heartbeat from an unknown peer doubles as its Join; the
            // signature was already checked against the embedded key
            match registry.observe_heartbeat(
                &announcement.identity.peer_id,
                &announcement.identity.public_key,
                now,
            ) {
                Ok(_) => {}
                Err(_) if pinned.is_none() => {
                    if registry.observe_join(announcement.identity.clone(), now)?
                        == RegistryChange::NewPeer
                    {
                        events.emit(NodeEvent::PeerDiscovered(announcement.identity.clone()));
                    }
                    registry.observe_heartbeat(
                        &announcement.identity.peer_id,
                        &announcement.identity.public_key,
                        now,
                    )?;
                }
                Err(err) => return Err(err),
            }
        }
        AnnouncementKind::Leave => {
            if let Some(identity) = registry.remove(&announcement.identity.peer_id) {
                events.emit(NodeEvent::PeerLost(identity));
            }
        }
    }
    Ok(())
}

async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    settings: DiscoverySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        match Announcement::signed(AnnouncementKind::Heartbeat, &local, &security) {
            Ok(beat) => {
                if let Err(err) = send_announcement(&socket, &beat, settings.announce_addr).await {
                    warn!(error = %err, "heartbeat broadcast failed");
                }
            }
            Err(err) => warn!(error = %err, "heartbeat signing failed"),
        }

        for lost in registry.sweep(
            Instant::now(),
            settings.heartbeat_interval,
            settings.peer_timeout,
        ) {
            events.emit(NodeEvent::PeerLost(lost));
        }
    }
}
