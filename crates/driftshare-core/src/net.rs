// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::error::NodeError;
use crate::identity::PeerIdentity;
use crate::peers::PeerRegistry;
use crate::security::SecurityContext;
use crate::transport::connect_channel;
use crate::wire::{Message, read_message, write_message};

/// One-shot request/response exchange with a peer over a fresh
/// authenticated channel. Search fan-out, response relaying, PIN
/// broadcast and preview fetches all go through this seam, which keeps
/// them testable without sockets.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn request(
        &self,
        peer: &PeerIdentity,
        message: Message,
        timeout: Duration,
    ) -> anyhow::Result<Message>;
}

pub struct TlsRequestTransport {
    security: Arc<SecurityContext>,
    local_identity: PeerIdentity,
    registry: Arc<PeerRegistry>,
}

impl TlsRequestTransport {
    pub fn new(
        security: Arc<SecurityContext>,
        local_identity: PeerIdentity,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            security,
            local_identity,
            registry,
        }
    }

    async fn resolve(peer: &PeerIdentity) -> anyhow::Result<SocketAddr> {
        if peer.is_relay_only() {
            anyhow::bail!(NodeError::transport(format!(
                "peer {} has no direct address",
                peer.peer_id
            )));
        }
        lookup_host((peer.host.as_str(), peer.port))
            .await?
            .next()
            .ok_or_else(|| {
                NodeError::transport(format!("no address for {}:{}", peer.host, peer.port)).into()
            })
    }
}

#[async_trait]
impl RequestTransport for TlsRequestTransport {
    async fn request(
        &self,
        peer: &PeerIdentity,
        message: Message,
        timeout: Duration,
    ) -> anyhow::Result<Message> {
        let pinned = self.registry.pinned_key(&peer.peer_id);
        let exchange = async {
            let addr = Self::resolve(peer).await?;
            let (mut stream, _session) =
                connect_channel(addr, &self.security, &self.local_identity, pinned).await?;
            write_message(&mut stream, &message).await?;
            read_message(&mut stream).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| NodeError::timeout(format!("request to {} timed out", peer.peer_id)))?
    }
}
