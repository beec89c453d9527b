// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::identity::{PeerIdentity, SharedFileSummary};
use crate::net::RequestTransport;
use crate::peers::PeerRegistry;
use crate::relay::protocol::RelayFileRef;
use crate::security::SecurityContext;
use crate::transport::now_unix_secs;
use crate::wire::{Message, PinCancel, SignedPinMessage};

const PIN_DIGITS: u32 = 6;
const PIN_SPACE: u64 = 1_000_000;

/// A live six-digit rendezvous binding. Resolvable while unexpired and
/// not cancelled.
#[derive(Debug, Clone)]
pub struct PinSession {
    pub pin: String,
    pub file: SharedFileSummary,
    pub owner: PeerIdentity,
    pub created_at_unix: u64,
    pub expires_at_unix: u64,
    pub cancelled: bool,
}

impl PinSession {
    pub fn is_resolvable(&self, now_unix: u64) -> bool {
        !self.cancelled && now_unix < self.expires_at_unix
    }
}

/// Relay-side PIN registry operations, kept behind a trait so the service
/// tests without a live relay.
#[async_trait]
pub trait PinRelay: Send + Sync {
    async fn create_pin(
        &self,
        pin: &str,
        file: &RelayFileRef,
        expiry: Duration,
    ) -> anyhow::Result<()>;
    async fn find_pin(&self, pin: &str) -> anyhow::Result<Option<RelayFileRef>>;
}

/// Issues six-digit codes bound to a shared file, broadcasts them signed
/// to every known peer, and resolves codes first from the local cache and
/// then through the relay.
pub struct PinService {
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn RequestTransport>,
    relay: Option<Arc<dyn PinRelay>>,
    events: EventBus,
    lifetime: Duration,
    broadcast_timeout: Duration,
    /// PINs this node issued.
    local_sessions: Mutex<HashMap<String, PinSession>>,
    /// PINs learned from peers.
    global_sessions: Mutex<HashMap<String, PinSession>>,
}

impl PinService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        security: Arc<SecurityContext>,
        local: PeerIdentity,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn RequestTransport>,
        relay: Option<Arc<dyn PinRelay>>,
        events: EventBus,
        lifetime: Duration,
        broadcast_timeout: Duration,
    ) -> Self {
        Self {
            security,
            local,
            registry,
            transport,
            relay,
            events,
            lifetime,
            broadcast_timeout,
            local_sessions: Mutex::new(HashMap::new()),
            global_sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Draw a uniformly random PIN, redrawing on collision with any live
    /// session in the given maps.
    fn unique_pin_locked(
        rng: &mut impl Rng,
        local: &HashMap<String, PinSession>,
        global: &HashMap<String, PinSession>,
    ) -> anyhow::Result<String> {
        if (local.len() + global.len()) as u64 >= PIN_SPACE {
            anyhow::bail!(NodeError::protocol("pin space exhausted"));
        }
        let live = |sessions: &HashMap<String, PinSession>, candidate: &str| {
            sessions
                .get(candidate)
                .map(|session| !session.cancelled)
                .unwrap_or(false)
        };
        loop {
            let candidate = format!(
                "{:0width$}",
                rng.gen_range(0..PIN_SPACE),
                width = PIN_DIGITS as usize
            );
            if !live(local, &candidate) && !live(global, &candidate) {
                return Ok(candidate);
            }
        }
    }

    #[cfg(test)]
    fn unique_pin(&self, rng: &mut impl Rng) -> anyhow::Result<String> {
        let local = self.local_sessions.lock().expect("pin sessions poisoned");
        let global = self.global_sessions.lock().expect("pin sessions poisoned");
        Self::unique_pin_locked(rng, &local, &global)
    }

    /// Create a PIN for a shared file, broadcast it to every known peer
    /// (per-peer failures are swallowed), and register it with the relay
    /// when the file is mirrored there.
    pub async fn create_pin(
        self: &Arc<Self>,
        file: SharedFileSummary,
    ) -> anyhow::Result<PinSession> {
        let now = now_unix_secs()?;
        // draw and reserve under one lock scope so concurrent creators
        // can never race into the same live pin
        let session = {
            let mut local = self.local_sessions.lock().expect("pin sessions poisoned");
            let global = self.global_sessions.lock().expect("pin sessions poisoned");
            let pin = Self::unique_pin_locked(&mut rand::thread_rng(), &local, &global)?;
            let session = PinSession {
                pin: pin.clone(),
                file: file.clone(),
                owner: self.local.clone(),
                created_at_unix: now,
                expires_at_unix: now + self.lifetime.as_secs(),
                cancelled: false,
            };
            local.insert(pin, session.clone());
            session
        };
        let pin = session.pin.clone();

        let signable = SignedPinMessage::signable_bytes(&pin, &file.logical_name);
        let announce = SignedPinMessage {
            sender: self.local.clone(),
            pin: pin.clone(),
            file: file.clone(),
            created_at_unix: session.created_at_unix,
            expires_at_unix: session.expires_at_unix,
            signature: self.security.sign(&signable).to_vec(),
        };

        let service = Arc::clone(self);
        let broadcast = announce.clone();
        tokio::spawn(async move {
            service.broadcast_announce(broadcast).await;
        });

        if let (Some(relay), Some(relay_ref)) = (&self.relay, &file.relay_ref) {
            if let Err(err) = relay.create_pin(&pin, relay_ref, self.lifetime).await {
                warn!(pin = %pin, error = %err, "relay pin registration failed");
            }
        }

        info!(pin = %pin, file = %file.logical_name, "pin created");
        self.events.emit(NodeEvent::PinCreated {
            pin: pin.clone(),
            file_name: file.logical_name.clone(),
        });
        Ok(session)
    }

    async fn broadcast_announce(&self, announce: SignedPinMessage) {
        let mut tasks = JoinSet::new();
        for peer in self.registry.known_peers() {
            let transport = Arc::clone(&self.transport);
            let announce = announce.clone();
            let timeout = self.broadcast_timeout;
            tasks.spawn(async move {
                if let Err(err) = transport
                    .request(&peer, Message::PinAnnounce(announce), timeout)
                    .await
                {
                    debug!(peer = %peer.peer_id, error = %err, "pin broadcast failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// A signed PIN announcement arrived from a peer. Verified against the
    /// pinned key when the sender is known, otherwise the advertised key.
    pub fn handle_announce(&self, announce: SignedPinMessage) -> anyhow::Result<()> {
        let key = self
            .registry
            .pinned_key(&announce.sender.peer_id)
            .unwrap_or(announce.sender.public_key);
        let signable = SignedPinMessage::signable_bytes(&announce.pin, &announce.file.logical_name);
        SecurityContext::verify(&signable, &announce.signature, &key)?;

        let session = PinSession {
            pin: announce.pin.clone(),
            file: announce.file.clone(),
            owner: announce.sender.clone(),
            created_at_unix: announce.created_at_unix,
            expires_at_unix: announce.expires_at_unix,
            cancelled: false,
        };
        self.global_sessions
            .lock()
            .expect("pin sessions poisoned")
            .insert(announce.pin.clone(), session);

        self.events.emit(NodeEvent::PinReceived {
            pin: announce.pin,
            owner: announce.sender,
            file_name: announce.file.logical_name,
        });
        Ok(())
    }

    /// A signed cancellation. Only the session owner's key may cancel.
    pub fn handle_cancel(&self, cancel: PinCancel) -> anyhow::Result<()> {
        let mut global = self.global_sessions.lock().expect("pin sessions poisoned");
        let Some(session) = global.get_mut(&cancel.pin) else {
            anyhow::bail!(NodeError::not_found("unknown pin"));
        };
        SecurityContext::verify(
            &PinCancel::signable_bytes(&cancel.pin),
            &cancel.signature,
            &session.owner.public_key,
        )?;
        session.cancelled = true;
        Ok(())
    }

    /// Resolve a PIN: local cache first, then the relay registry. A relay
    /// hit materializes a synthetic session whose owner points at the
    /// relay.
    pub async fn find_by_pin(&self, pin: &str) -> anyhow::Result<Option<PinSession>> {
        let now = now_unix_secs()?;
        {
            let local = self.local_sessions.lock().expect("pin sessions poisoned");
            if let Some(session) = local.get(pin) {
                return Ok(session.is_resolvable(now).then(|| session.clone()));
            }
        }
        {
            let global = self.global_sessions.lock().expect("pin sessions poisoned");
            if let Some(session) = global.get(pin) {
                if session.is_resolvable(now) {
                    return Ok(Some(session.clone()));
                }
                // fall through: the relay may know a fresher binding
            }
        }

        let Some(relay) = &self.relay else {
            return Ok(None);
        };
        let Some(relay_ref) = relay.find_pin(pin).await? else {
            return Ok(None);
        };

        let owner =
            PeerIdentity::relay_synthetic(&relay_ref.sender_id, relay_ref.sender_name.as_deref());
        let session = PinSession {
            pin: pin.to_owned(),
            file: relay_ref.to_summary(),
            owner,
            created_at_unix: now,
            expires_at_unix: relay_ref
                .expires_at_unix
                .unwrap_or(now + self.lifetime.as_secs()),
            cancelled: false,
        };
        Ok(Some(session))
    }

    /// Cancel a PIN this node issued and tell peers to drop it.
    pub async fn cancel_pin(self: &Arc<Self>, pin: &str) -> anyhow::Result<()> {
        {
            let mut local = self.local_sessions.lock().expect("pin sessions poisoned");
            let session = local
                .get_mut(pin)
                .ok_or_else(|| NodeError::not_found("unknown pin"))?;
            session.cancelled = true;
        }
        let cancel = PinCancel {
            sender_id: self.local.peer_id.clone(),
            pin: pin.to_owned(),
            signature: self
                .security
                .sign(&PinCancel::signable_bytes(pin))
                .to_vec(),
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for peer in service.registry.known_peers() {
                let transport = Arc::clone(&service.transport);
                let cancel = cancel.clone();
                let timeout = service.broadcast_timeout;
                tasks.spawn(async move {
                    let _ = transport
                        .request(&peer, Message::PinCancel(cancel), timeout)
                        .await;
                });
            }
            while tasks.join_next().await.is_some() {}
        });
        Ok(())
    }

    pub fn active_sessions(&self) -> Vec<PinSession> {
        let now = now_unix_secs().unwrap_or(0);
        let local = self.local_sessions.lock().expect("pin sessions poisoned");
        let global = self.global_sessions.lock().expect("pin sessions poisoned");
        local
            .values()
            .chain(global.values())
            .filter(|session| session.is_resolvable(now))
            .cloned()
            .collect()
    }

    /// Drop expired sessions and fire `PinExpired` for each.
    pub fn sweep(&self, now_unix: u64) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let mut local = self.local_sessions.lock().expect("pin sessions poisoned");
            local.retain(|pin, session| {
                let keep = now_unix < session.expires_at_unix;
                if !keep {
                    expired.push(pin.clone());
                }
                keep
            });
        }
        {
            let mut global = self.global_sessions.lock().expect("pin sessions poisoned");
            global.retain(|pin, session| {
                let keep = now_unix < session.expires_at_unix;
                if !keep {
                    expired.push(pin.clone());
                }
                keep
            });
        }
        for pin in &expired {
            self.events.emit(NodeEvent::PinExpired { pin: pin.clone() });
        }
        expired
    }

    /// Periodic expiry sweeper; every 5 seconds by convention.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match now_unix_secs() {
                    Ok(now) => {
                        service.sweep(now);
                    }
                    Err(err) => warn!(error = %err, "pin sweeper clock failure"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};
    use crate::identity::FileHash;
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct NullTransport;

    #[async_trait]
    impl RequestTransport for NullTransport {
        async fn request(
            &self,
            _peer: &PeerIdentity,
            _message: Message,
            _timeout: Duration,
        ) -> anyhow::Result<Message> {
            Ok(Message::Ok)
        }
    }

    struct StubRelay {
        stored: Mutex<HashMap<String, RelayFileRef>>,
    }

    #[async_trait]
    impl PinRelay for StubRelay {
        async fn create_pin(
            &self,
            pin: &str,
            file: &RelayFileRef,
            _expiry: Duration,
        ) -> anyhow::Result<()> {
            self.stored
                .lock()
                .expect("stub relay")
                .insert(pin.to_owned(), file.clone());
            Ok(())
        }

        async fn find_pin(&self, pin: &str) -> anyhow::Result<Option<RelayFileRef>> {
            Ok(self.stored.lock().expect("stub relay").get(pin).cloned())
        }
    }

    fn security(seed: u64) -> Arc<SecurityContext> {
        let mut rng = StdRng::seed_from_u64(seed);
        Arc::new(SecurityContext::from_signing_key(SigningKey::generate(&mut rng)).expect("ctx"))
    }

    fn identity(id: &str, security: &SecurityContext) -> PeerIdentity {
        PeerIdentity {
            peer_id: id.to_owned(),
            display_name: id.to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 9000,
            public_key: security.public_key(),
        }
    }

    fn summary(name: &str) -> SharedFileSummary {
        SharedFileSummary {
            logical_name: name.to_owned(),
            size: 128,
            file_hash: FileHash([5u8; 32]),
            owner_peer_id: "owner-1".to_owned(),
            relay_ref: None,
        }
    }

    fn service(seed: u64, relay: Option<Arc<dyn PinRelay>>) -> Arc<PinService> {
        let security = security(seed);
        let local = identity("owner-1", &security);
        Arc::new(PinService::new(
            security,
            local,
            Arc::new(PeerRegistry::new()),
            Arc::new(NullTransport),
            relay,
            EventBus::new(32),
            Duration::from_secs(600),
            Duration::from_secs(2),
        ))
    }

    #[tokio::test]
    async fn created_pin_is_six_digits_and_resolvable() {
        let service = service(1, None);
        let session = service.create_pin(summary("doc.pdf")).await.expect("pin");
        assert_eq!(session.pin.len(), 6);
        assert!(session.pin.chars().all(|c| c.is_ascii_digit()));

        let found = service
            .find_by_pin(&session.pin)
            .await
            .expect("lookup")
            .expect("resolvable");
        assert_eq!(found.file.logical_name, "doc.pdf");
    }

    #[tokio::test]
    async fn colliding_draw_is_redrawn_until_unique() {
        let service = service(2, None);
        // discover what a seeded rng draws first, then occupy that pin
        let mut probe = StdRng::seed_from_u64(99);
        let first_draw = service.unique_pin(&mut probe).expect("draw");
        let now = now_unix_secs().expect("now");
        service.local_sessions.lock().expect("sessions").insert(
            first_draw.clone(),
            PinSession {
                pin: first_draw.clone(),
                file: summary("occupied.bin"),
                owner: service.local.clone(),
                created_at_unix: now,
                expires_at_unix: now + 600,
                cancelled: false,
            },
        );

        let mut same_seed = StdRng::seed_from_u64(99);
        let second_draw = service.unique_pin(&mut same_seed).expect("redraw");
        assert_ne!(second_draw, first_draw, "live pin must be redrawn");
    }

    #[tokio::test]
    async fn announce_requires_valid_signature() {
        let owner_security = security(3);
        let owner = identity("owner-1", &owner_security);
        let receiver = service(4, None);

        let signable = SignedPinMessage::signable_bytes("482193", "doc.pdf");
        let now = now_unix_secs().expect("now");
        let mut announce = SignedPinMessage {
            sender: owner.clone(),
            pin: "482193".to_owned(),
            file: summary("doc.pdf"),
            created_at_unix: now,
            expires_at_unix: now + 600,
            signature: owner_security.sign(&signable).to_vec(),
        };
        receiver
            .handle_announce(announce.clone())
            .expect("authentic announce");
        assert!(receiver
            .find_by_pin("482193")
            .await
            .expect("lookup")
            .is_some());

        // a random signature under the same claimed owner must be dropped
        announce.pin = "111111".to_owned();
        announce.signature = vec![7u8; 64];
        let err = receiver
            .handle_announce(announce)
            .expect_err("forged announce");
        assert_eq!(error_kind(&err), ErrorKind::Permission);
        assert!(receiver
            .find_by_pin("111111")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn cancelled_pin_stops_resolving() {
        let service = service(5, None);
        let session = service.create_pin(summary("doc.pdf")).await.expect("pin");
        service.cancel_pin(&session.pin).await.expect("cancel");
        assert!(service
            .find_by_pin(&session.pin)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn sweep_expires_sessions_and_emits_events() {
        let service = service(6, None);
        let mut events = service.events.subscribe();
        let session = service.create_pin(summary("doc.pdf")).await.expect("pin");
        let _ = events.recv().await.expect("created event");

        let expired = service.sweep(session.expires_at_unix + 1);
        assert_eq!(expired, vec![session.pin.clone()]);
        match events.recv().await.expect("expired event") {
            NodeEvent::PinExpired { pin } => assert_eq!(pin, session.pin),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(service
            .find_by_pin(&session.pin)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn relay_fallback_materializes_synthetic_session() {
        let relay = Arc::new(StubRelay {
            stored: Mutex::new(HashMap::new()),
        });
        let service = service(7, Some(relay.clone() as Arc<dyn PinRelay>));

        relay
            .create_pin(
                "482193",
                &RelayFileRef {
                    upload_id: "up-1".to_owned(),
                    file_name: "doc.pdf".to_owned(),
                    file_size: 4096,
                    file_hash: Some(FileHash([9u8; 32]).to_hex()),
                    download_url: "http://relay.example/api/relay/download/up-1".to_owned(),
                    sender_id: "remote-owner".to_owned(),
                    sender_name: Some("O".to_owned()),
                    recipient_id: None,
                    encrypted: false,
                    encryption_algorithm: None,
                    mime_type: None,
                    expires_at_unix: None,
                    download_count: 0,
                    max_downloads: 0,
                },
                Duration::from_secs(600),
            )
            .await
            .expect("seed relay");

        let session = service
            .find_by_pin("482193")
            .await
            .expect("lookup")
            .expect("relay hit");
        assert!(session.owner.is_relay_only());
        assert_eq!(session.file.logical_name, "doc.pdf");
        assert!(session.file.relay_ref.is_some());
    }
}
