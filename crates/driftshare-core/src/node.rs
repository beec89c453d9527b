// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, RelayConfig};
use crate::discovery::{DiscoveryHandle, DiscoveryService, DiscoverySettings};
use crate::engine::{DownloadOutcome, ServeContext, TransferEngine, serve_connection};
use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::identity::{FileHash, PeerIdentity, SharedFile, SharedFileSummary};
use crate::net::{RequestTransport, TlsRequestTransport};
use crate::peers::PeerRegistry;
use crate::pin::{PinRelay, PinService, PinSession};
use crate::preview::{PreviewContent, PreviewKind, PreviewManifest, PreviewService, PreviewSettings, verify_content};
use crate::relay::client::{RelayClient, RelayUploadRequest};
use crate::search::{SearchOutcome, SearchService, ShareIndex};
use crate::security::SecurityContext;
use crate::transport::NonceTracker;
use crate::wire::{ContentRequest, ManifestRequest, Message};

/// One running endpoint: simultaneously client and server. Owns the
/// security context, the service set, the TLS accept loop, and the event
/// stream the UI drains.
pub struct Node {
    config: NodeConfig,
    security: Arc<SecurityContext>,
    identity: PeerIdentity,
    registry: Arc<PeerRegistry>,
    index: Arc<ShareIndex>,
    events: EventBus,
    transport: Arc<dyn RequestTransport>,
    search: Arc<SearchService>,
    pin: Arc<PinService>,
    preview: Arc<PreviewService>,
    engine: Arc<TransferEngine>,
    relay: Option<Arc<RelayClient>>,
}

/// Background tasks of a started node, shut down together.
pub struct NodeHandle {
    node: Arc<Node>,
    local_addr: SocketAddr,
    discovery: Option<DiscoveryHandle>,
    accept_task: tokio::task::JoinHandle<()>,
    pin_sweeper: tokio::task::JoinHandle<()>,
    relay_task: Option<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Bind the listener, assemble the services, and start the background
    /// loops. `relay_config` enables the relay profile.
    pub async fn start(
        config: NodeConfig,
        relay_config: Option<RelayConfig>,
    ) -> anyhow::Result<NodeHandle> {
        let security = Arc::new(SecurityContext::generate()?);
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .context("bind transfer listener")?;
        let local_addr = listener.local_addr()?;

        let identity = PeerIdentity {
            peer_id: uuid::Uuid::new_v4().to_string(),
            display_name: config.display_name.clone(),
            host: detect_local_ip(),
            port: local_addr.port(),
            public_key: security.public_key(),
        };
        info!(peer_id = %identity.peer_id, port = identity.port, "starting node");

        let registry = Arc::new(PeerRegistry::new());
        let index = Arc::new(ShareIndex::new());
        let events = EventBus::default();
        let relay = relay_config.map(|config| Arc::new(RelayClient::new(config)));

        let transport: Arc<dyn RequestTransport> = Arc::new(TlsRequestTransport::new(
            Arc::clone(&security),
            identity.clone(),
            Arc::clone(&registry),
        ));
        let search = Arc::new(SearchService::new(
            Arc::clone(&index),
            Arc::clone(&registry),
            Arc::clone(&transport),
            events.clone(),
            identity.clone(),
            config.search_timeout,
        ));
        let pin = Arc::new(PinService::new(
            Arc::clone(&security),
            identity.clone(),
            Arc::clone(&registry),
            Arc::clone(&transport),
            relay
                .as_ref()
                .map(|client| Arc::clone(client) as Arc<dyn PinRelay>),
            events.clone(),
            config.pin_lifetime,
            config.connection_timeout,
        ));
        let preview = Arc::new(PreviewService::new(
            Arc::clone(&index),
            Arc::clone(&security),
            PreviewSettings {
                max_file_size: config.preview_max_file_size,
                thumbnail_size: config.preview_thumbnail_size,
                text_max_lines: config.preview_text_max_lines,
                text_max_chars: config.preview_text_max_chars,
                ..PreviewSettings::default()
            },
        ));
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&security),
            identity.clone(),
            Arc::clone(&registry),
            events.clone(),
            config.clone(),
            relay.clone(),
        ));

        let node = Arc::new(Node {
            config: config.clone(),
            security: Arc::clone(&security),
            identity: identity.clone(),
            registry: Arc::clone(&registry),
            index: Arc::clone(&index),
            events: events.clone(),
            transport,
            search: Arc::clone(&search),
            pin: Arc::clone(&pin),
            preview: Arc::clone(&preview),
            engine,
            relay: relay.clone(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&node)));
        let pin_sweeper = pin.spawn_sweeper(Duration::from_secs(5));

        let discovery = DiscoveryService::new(
            Arc::clone(&security),
            identity.clone(),
            Arc::clone(&registry),
            events.clone(),
            DiscoverySettings::lan(
                config.discovery_port,
                config.heartbeat_interval,
                config.peer_timeout,
            ),
        )
        .spawn()
        .await
        .map_err(|err| {
            warn!(error = %err, "lan discovery unavailable");
            err
        })
        .ok();

        let relay_task = relay.map(|client| {
            tokio::spawn(relay_membership_loop(
                client,
                identity.clone(),
                Arc::clone(&registry),
                events.clone(),
                config.heartbeat_interval,
            ))
        });

        Ok(NodeHandle {
            node,
            local_addr,
            discovery,
            accept_task,
            pin_sweeper,
            relay_task,
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Share a file: index it and generate its signed preview manifest.
    pub fn share_file(&self, directory: &str, path: &Path) -> anyhow::Result<SharedFile> {
        let shared = self
            .index
            .add_path(directory, path, &self.identity.peer_id)?;
        self.preview.generate_for(&shared)?;
        self.events.emit(NodeEvent::PreviewReady {
            file_hash: shared.file_hash,
        });
        Ok(shared)
    }

    pub fn unshare_file(&self, directory: &str, logical_name: &str) {
        self.index.remove_file(directory, logical_name);
    }

    /// Mirror a shared file onto the relay and register it for search.
    pub async fn mirror_to_relay(&self, shared: &SharedFile) -> anyhow::Result<()> {
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| NodeError::not_found("no relay configured"))?;
        let request = RelayUploadRequest {
            sender_id: self.identity.peer_id.clone(),
            sender_name: Some(self.identity.display_name.clone()),
            sender_public_key: self.security.public_key(),
            recipient_id: None,
            mime_type: Some(crate::preview::mime_type_for(&shared.logical_name).to_owned()),
        };
        let reference = relay
            .upload_file(&shared.local_path, &request, None)
            .await?;
        relay.register_file(&reference).await?;
        self.index.attach_relay_ref(shared.file_hash, reference);
        Ok(())
    }

    pub async fn search(&self, query: &str) -> anyhow::Result<SearchOutcome> {
        self.search.search(query, self.config.search_ttl).await
    }

    /// Search the relay's file index as well (relay profile).
    pub async fn search_relay(&self, query: &str) -> anyhow::Result<Vec<SharedFileSummary>> {
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| NodeError::not_found("no relay configured"))?;
        let refs = relay
            .search_files(query, Some(&self.identity.peer_id))
            .await?;
        Ok(refs.iter().map(|reference| reference.to_summary()).collect())
    }

    pub async fn download(
        &self,
        peer: PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<DownloadOutcome> {
        self.engine.download(peer, file).await
    }

    pub async fn download_with_fallback(
        &self,
        peer: PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<DownloadOutcome> {
        self.engine.download_with_fallback(peer, file).await
    }

    pub fn pause_transfer(&self, transfer_id: &str) {
        self.engine.pause(transfer_id);
    }

    pub fn resume_transfer(&self, transfer_id: &str) {
        self.engine.resume(transfer_id);
    }

    pub fn cancel_transfer(&self, transfer_id: &str) {
        self.engine.cancel(transfer_id);
    }

    pub async fn create_pin(&self, file_hash: FileHash) -> anyhow::Result<PinSession> {
        let shared = self
            .index
            .find_by_hash(file_hash)
            .ok_or_else(|| NodeError::not_found("file is not shared"))?;
        let mut summary = shared.summary();
        // carry the relay ref so remote receivers can fall back
        summary.relay_ref = self.index.relay_ref_for(file_hash);
        self.pin.create_pin(summary).await
    }

    pub async fn find_by_pin(&self, pin: &str) -> anyhow::Result<Option<PinSession>> {
        self.pin.find_by_pin(pin).await
    }

    pub async fn cancel_pin(&self, pin: &str) -> anyhow::Result<()> {
        self.pin.cancel_pin(pin).await
    }

    /// Fetch a peer's preview manifest and verify its signature before
    /// returning it. An unverifiable manifest is discarded.
    pub async fn fetch_manifest(
        &self,
        peer: &PeerIdentity,
        file_hash: FileHash,
    ) -> anyhow::Result<PreviewManifest> {
        let reply = self
            .transport
            .request(
                peer,
                Message::GetManifest(ManifestRequest { file_hash }),
                self.config.connection_timeout,
            )
            .await?;
        let manifest = match reply {
            Message::Manifest(manifest) => manifest,
            Message::Err(err) => anyhow::bail!(err.to_node_error()),
            other => anyhow::bail!(NodeError::protocol(format!(
                "expected manifest, got command 0x{:02x}",
                other.command()
            ))),
        };
        let owner_key = self
            .registry
            .pinned_key(&manifest.owner_peer_id)
            .unwrap_or(peer.public_key);
        manifest.verify(&owner_key)?;
        Ok(manifest)
    }

    /// Fetch preview content and accept it only when its digest matches
    /// the verified manifest.
    pub async fn fetch_preview_content(
        &self,
        peer: &PeerIdentity,
        manifest: &PreviewManifest,
        kind: PreviewKind,
    ) -> anyhow::Result<PreviewContent> {
        let reply = self
            .transport
            .request(
                peer,
                Message::GetContent(ContentRequest {
                    file_hash: manifest.file_hash,
                    kind,
                }),
                self.config.connection_timeout,
            )
            .await?;
        let content = match reply {
            Message::Content(content) => content,
            Message::Err(err) => anyhow::bail!(err.to_node_error()),
            other => anyhow::bail!(NodeError::protocol(format!(
                "expected preview content, got command 0x{:02x}",
                other.command()
            ))),
        };
        verify_content(manifest, &content)?;
        Ok(content)
    }

    pub fn shared_files(&self) -> Vec<SharedFile> {
        self.index.all_files()
    }
}

impl NodeHandle {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        if let Some(discovery) = self.discovery {
            discovery.shutdown().await;
        }
        if let Some(relay_task) = self.relay_task {
            relay_task.abort();
        }
        self.pin_sweeper.abort();
        self.accept_task.abort();
        info!("node stopped");
    }
}

/// Accept TLS channels and hand each to a serving task.
async fn accept_loop(listener: TcpListener, node: Arc<Node>) {
    let acceptor = match node.security.tls_acceptor() {
        Ok(acceptor) => acceptor,
        Err(err) => {
            warn!(error = %err, "tls acceptor unavailable, listener down");
            return;
        }
    };
    let nonce_tracker = Arc::new(Mutex::new(NonceTracker::new()));

    loop {
        let accepted = crate::transport::accept_channel(
            &listener,
            &acceptor,
            &node.security,
            &node.identity,
            None,
        )
        .await;
        let (mut stream, session, remote_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(error = %err, "inbound channel rejected");
                continue;
            }
        };

        // replay check is shared across connections
        {
            let mut tracker = nonce_tracker.lock().expect("nonce tracker poisoned");
            if let Ok(now) = crate::transport::now_unix_secs() {
                if tracker.check_and_record(session.remote_nonce, now).is_err() {
                    warn!(%remote_addr, "replayed handshake nonce, dropping channel");
                    continue;
                }
            }
        }

        // an inbound authenticated channel is also a liveness signal and
        // pins the key for peers the discovery channel has not seen yet
        let _ = node
            .registry
            .observe_join(session.remote.clone(), Instant::now());

        let ctx = ServeContext {
            index: Arc::clone(&node.index),
            search: Arc::clone(&node.search),
            pin: Arc::clone(&node.pin),
            preview: Arc::clone(&node.preview),
            direct_chunk_size: node.config.direct_chunk_size as u32,
        };
        tokio::spawn(async move {
            if let Err(err) = serve_connection(&mut stream, &session, &ctx).await {
                debug!(peer = %session.remote.peer_id, error = %err, "serving channel ended");
            }
        });
    }
}

/// Relay-profile membership: register once, then heartbeat and merge the
/// relay's peer list on the discovery cadence.
async fn relay_membership_loop(
    relay: Arc<RelayClient>,
    identity: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    interval: Duration,
) {
    match relay.register_peer(&identity).await {
        Ok(public_ip) => info!(%public_ip, "registered with relay"),
        Err(err) => warn!(error = %err, "relay registration failed"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = relay.heartbeat(&identity.peer_id).await {
            warn!(error = %err, "relay heartbeat failed");
            continue;
        }
        match relay.list_peers(&identity.peer_id).await {
            Ok(peers) => {
                for peer in peers {
                    let Ok(key_bytes) = hex::decode(&peer.public_key) else {
                        continue;
                    };
                    let Ok(public_key) = <[u8; 32]>::try_from(key_bytes) else {
                        continue;
                    };
                    let discovered = PeerIdentity {
                        peer_id: peer.peer_id,
                        display_name: peer.display_name,
                        host: peer.ip_address,
                        port: peer.port,
                        public_key,
                    };
                    if let Ok(crate::peers::RegistryChange::NewPeer) =
                        registry.observe_join(discovered.clone(), Instant::now())
                    {
                        events.emit(NodeEvent::PeerDiscovered(discovered));
                    }
                }
            }
            Err(err) => debug!(error = %err, "relay peer list failed"),
        }
    }
}

/// Best-effort LAN address detection; falls back to loopback when the
/// host is offline.
fn detect_local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("10.255.255.255:1")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_owned())
}
