// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::error::NodeError;
use crate::identity::PeerIdentity;
use crate::security::SecurityContext;

pub const HANDSHAKE_MAX_BYTES: usize = 64 * 1024;
pub const HANDSHAKE_MAX_CLOCK_SKEW_SECS: u64 = 5 * 60;

/// Current channel-protocol version. Bump when breaking changes land.
pub const PROTOCOL_VERSION: u16 = 1;

pub type ServerChannel = tokio_rustls::server::TlsStream<TcpStream>;
pub type ClientChannel = tokio_rustls::client::TlsStream<TcpStream>;

/// Generate a 32-byte handshake nonce from a CSPRNG.
pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn now_unix_secs() -> anyhow::Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Tracks recently seen handshake nonces so a recorded hello cannot be
/// replayed within the clock-skew window.
#[derive(Debug, Default)]
pub struct NonceTracker {
    seen: HashMap<[u8; 32], u64>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(&mut self, nonce: [u8; 32], now_unix: u64) -> anyhow::Result<()> {
        self.prune(now_unix);
        if self.seen.contains_key(&nonce) {
            anyhow::bail!(NodeError::permission("handshake nonce replay detected"));
        }
        self.seen.insert(nonce, now_unix);
        Ok(())
    }

    fn prune(&mut self, now_unix: u64) {
        let cutoff = now_unix.saturating_sub(HANDSHAKE_MAX_CLOCK_SKEW_SECS * 2);
        self.seen.retain(|_, ts| *ts > cutoff);
    }
}

/// The authenticated end state of a channel handshake: who the remote
/// claims (and proved) to be, and the symmetric key both sides derived for
/// chunk encryption on this session.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub remote: PeerIdentity,
    pub remote_nonce: [u8; 32],
    pub remote_protocol_version: u16,
    pub chunk_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelHello {
    pub identity: PeerIdentity,
    pub nonce: [u8; 32],
    pub echoed_nonce: Option<[u8; 32]>,
    pub timestamp_unix_secs: u64,
    pub protocol_version: u16,
    /// Ephemeral X25519 public key; the chunk key for the session is
    /// derived from the DH shared secret and both nonces.
    pub ephemeral_pubkey: [u8; 32],
    pub signature: Vec<u8>,
}

/// Fields signed during handshake, as a positional CBOR array so map key
/// ordering can never change the signed bytes. The ephemeral key is
/// included so a MITM cannot substitute its own.
#[derive(Serialize)]
struct HelloSigningTuple<'a>(
    &'a PeerIdentity,
    [u8; 32],         // nonce
    Option<[u8; 32]>, // echoed_nonce
    u64,              // timestamp_unix_secs
    u16,              // protocol_version
    [u8; 32],         // ephemeral_pubkey
);

fn generate_ephemeral_x25519() -> (EphemeralSecret, [u8; 32]) {
    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519PublicKey::from(&secret);
    (secret, public.to_bytes())
}

/// Initiator (client) side of the 3-message handshake:
///
/// 1. **ClientHello** → our identity, nonce, ephemeral key.
/// 2. **ServerHello** ← remote identity echoing our nonce.
/// 3. **ClientAck**   → echo the server's nonce, proving we observed 2.
pub async fn handshake_initiator<S>(
    io: &mut S,
    security: &SecurityContext,
    local_identity: &PeerIdentity,
    local_nonce: [u8; 32],
    expected_remote_pubkey: Option<[u8; 32]>,
) -> anyhow::Result<ChannelSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (eph_secret, eph_pubkey) = generate_ephemeral_x25519();

    let client_hello = signed_hello(security, local_identity, local_nonce, None, eph_pubkey)?;
    write_hello(io, &client_hello).await?;

    let server_hello = read_hello(io).await?;
    verify_hello(&server_hello)?;
    if server_hello.echoed_nonce != Some(local_nonce) {
        anyhow::bail!(NodeError::permission(
            "server handshake does not bind initiator nonce",
        ));
    }
    if let Some(expected) = expected_remote_pubkey
        && server_hello.identity.public_key != expected
    {
        anyhow::bail!(NodeError::permission("remote pubkey mismatch"));
    }

    let ack = signed_hello(
        security,
        local_identity,
        local_nonce,
        Some(server_hello.nonce),
        eph_pubkey,
    )?;
    write_hello(io, &ack).await?;

    let dh_shared = eph_secret.diffie_hellman(&X25519PublicKey::from(server_hello.ephemeral_pubkey));
    let chunk_key =
        SecurityContext::session_chunk_key(dh_shared.as_bytes(), &local_nonce, &server_hello.nonce);

    let session = ChannelSession {
        remote: server_hello.identity,
        remote_nonce: server_hello.nonce,
        remote_protocol_version: server_hello.protocol_version,
        chunk_key,
    };
    check_protocol_version(&session)?;
    Ok(session)
}

/// Responder (server) side of the 3-message handshake; mirror of
/// [`handshake_initiator`]. `nonce_tracker` rejects replayed ClientHellos
/// when provided.
pub async fn handshake_responder<S>(
    io: &mut S,
    security: &SecurityContext,
    local_identity: &PeerIdentity,
    local_nonce: [u8; 32],
    expected_remote_pubkey: Option<[u8; 32]>,
    nonce_tracker: Option<&mut NonceTracker>,
) -> anyhow::Result<ChannelSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (eph_secret, eph_pubkey) = generate_ephemeral_x25519();

    let client_hello = read_hello(io).await?;
    verify_hello(&client_hello)?;

    if let Some(tracker) = nonce_tracker {
        tracker.check_and_record(client_hello.nonce, now_unix_secs()?)?;
    }

    if let Some(expected) = expected_remote_pubkey
        && client_hello.identity.public_key != expected
    {
        anyhow::bail!(NodeError::permission("remote pubkey mismatch"));
    }

    let server_hello = signed_hello(
        security,
        local_identity,
        local_nonce,
        Some(client_hello.nonce),
        eph_pubkey,
    )?;
    write_hello(io, &server_hello).await?;

    let ack = read_hello(io).await?;
    verify_hello(&ack)?;
    if ack.identity.public_key != client_hello.identity.public_key {
        anyhow::bail!(NodeError::permission(
            "client ack pubkey does not match initial hello",
        ));
    }
    if ack.echoed_nonce != Some(local_nonce) {
        anyhow::bail!(NodeError::permission(
            "client ack does not bind responder nonce",
        ));
    }

    let dh_shared = eph_secret.diffie_hellman(&X25519PublicKey::from(client_hello.ephemeral_pubkey));
    let chunk_key =
        SecurityContext::session_chunk_key(dh_shared.as_bytes(), &client_hello.nonce, &local_nonce);

    let session = ChannelSession {
        remote: client_hello.identity,
        remote_nonce: client_hello.nonce,
        remote_protocol_version: client_hello.protocol_version,
        chunk_key,
    };
    check_protocol_version(&session)?;
    Ok(session)
}

fn check_protocol_version(session: &ChannelSession) -> anyhow::Result<()> {
    if session.remote_protocol_version != PROTOCOL_VERSION {
        anyhow::bail!(NodeError::protocol(format!(
            "incompatible protocol version: local={}, remote={}",
            PROTOCOL_VERSION, session.remote_protocol_version
        )));
    }
    Ok(())
}

fn signed_hello(
    security: &SecurityContext,
    identity: &PeerIdentity,
    nonce: [u8; 32],
    echoed_nonce: Option<[u8; 32]>,
    ephemeral_pubkey: [u8; 32],
) -> anyhow::Result<ChannelHello> {
    signed_hello_at(
        security,
        identity,
        nonce,
        echoed_nonce,
        now_unix_secs()?,
        ephemeral_pubkey,
    )
}

fn signed_hello_at(
    security: &SecurityContext,
    identity: &PeerIdentity,
    nonce: [u8; 32],
    echoed_nonce: Option<[u8; 32]>,
    timestamp_unix_secs: u64,
    ephemeral_pubkey: [u8; 32],
) -> anyhow::Result<ChannelHello> {
    let signable = HelloSigningTuple(
        identity,
        nonce,
        echoed_nonce,
        timestamp_unix_secs,
        PROTOCOL_VERSION,
        ephemeral_pubkey,
    );
    let signature = security.sign(&serde_cbor::to_vec(&signable)?);
    Ok(ChannelHello {
        identity: identity.clone(),
        nonce,
        echoed_nonce,
        timestamp_unix_secs,
        protocol_version: PROTOCOL_VERSION,
        ephemeral_pubkey,
        signature: signature.to_vec(),
    })
}

fn verify_hello(hello: &ChannelHello) -> anyhow::Result<()> {
    let now = now_unix_secs()?;
    let skew = now.abs_diff(hello.timestamp_unix_secs);
    if skew > HANDSHAKE_MAX_CLOCK_SKEW_SECS {
        anyhow::bail!(NodeError::permission(
            "handshake timestamp outside allowed clock skew",
        ));
    }
    let signable = HelloSigningTuple(
        &hello.identity,
        hello.nonce,
        hello.echoed_nonce,
        hello.timestamp_unix_secs,
        hello.protocol_version,
        hello.ephemeral_pubkey,
    );
    SecurityContext::verify(
        &serde_cbor::to_vec(&signable)?,
        &hello.signature,
        &hello.identity.public_key,
    )
}

async fn write_hello<S>(io: &mut S, hello: &ChannelHello) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = serde_cbor::to_vec(hello)?;
    if bytes.len() > HANDSHAKE_MAX_BYTES {
        anyhow::bail!(NodeError::protocol("handshake exceeds max size"));
    }
    let len = u32::try_from(bytes.len()).context("handshake length")?;
    io.write_u32(len).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

async fn read_hello<S>(io: &mut S) -> anyhow::Result<ChannelHello>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > HANDSHAKE_MAX_BYTES {
        anyhow::bail!(NodeError::protocol("handshake exceeds max size"));
    }
    let mut bytes = vec![0u8; len];
    io.read_exact(&mut bytes).await?;
    Ok(serde_cbor::from_slice(&bytes)?)
}

/// Dial a peer, run TLS with first-contact acceptance, then the signed
/// handshake. `expected_remote_pubkey` is the pinned key when the peer is
/// already known.
pub async fn connect_channel(
    remote_addr: SocketAddr,
    security: &SecurityContext,
    local_identity: &PeerIdentity,
    expected_remote_pubkey: Option<[u8; 32]>,
) -> anyhow::Result<(ClientChannel, ChannelSession)> {
    let connector = SecurityContext::tls_connector()?;
    let server_name = SecurityContext::tls_server_name()?;
    let tcp_stream = TcpStream::connect(remote_addr).await?;
    let mut tls_stream = connector.connect(server_name, tcp_stream).await?;
    let session = handshake_initiator(
        &mut tls_stream,
        security,
        local_identity,
        generate_nonce(),
        expected_remote_pubkey,
    )
    .await?;
    Ok((tls_stream, session))
}

/// Accept one TLS connection and run the responder handshake.
pub async fn accept_channel(
    listener: &TcpListener,
    acceptor: &TlsAcceptor,
    security: &SecurityContext,
    local_identity: &PeerIdentity,
    nonce_tracker: Option<&mut NonceTracker>,
) -> anyhow::Result<(ServerChannel, ChannelSession, SocketAddr)> {
    let (tcp_stream, remote_addr) = listener.accept().await?;
    let mut tls_stream = acceptor.accept(tcp_stream).await?;
    let session = handshake_responder(
        &mut tls_stream,
        security,
        local_identity,
        generate_nonce(),
        None,
        nonce_tracker,
    )
    .await?;
    Ok((tls_stream, session, remote_addr))
}
