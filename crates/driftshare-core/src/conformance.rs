// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! End-to-end scenarios across the service seams: direct transfer,
//! resume, pause idempotence, cancellation cleanup, and the legacy
//! inline-stream path. The two halves of each test share an in-memory
//! duplex channel with a pre-agreed session, exactly what the TLS
//! handshake would have produced.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::engine::{
    EngineTuning, ServeContext, TransferCommand, fetch_inline_stream, run_transfer_loop,
    serve_connection,
};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{FileHash, PeerIdentity, SharedFile};
use crate::net::RequestTransport;
use crate::peers::PeerRegistry;
use crate::pin::PinService;
use crate::preview::{PreviewService, PreviewSettings};
use crate::search::{SearchService, ShareIndex};
use crate::security::SecurityContext;
use crate::transfer::{PartFile, TransferState, TransferStatus};
use crate::transport::ChannelSession;
use crate::wire::{Message, MetadataRequest, read_message, write_message};

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

struct NullTransport;

#[async_trait::async_trait]
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

/// A serving node reduced to its channel-facing parts.
fn serve_context(index: Arc<ShareIndex>, seed: u64) -> (ServeContext, Arc<SecurityContext>) {
    let security = security(seed);
    let local = identity("server", &security);
    let registry = Arc::new(PeerRegistry::new());
    let events = EventBus::new(64);
    let transport: Arc<dyn RequestTransport> = Arc::new(NullTransport);
    let search = Arc::new(SearchService::new(
        Arc::clone(&index),
        Arc::clone(&registry),
        Arc::clone(&transport),
        events.clone(),
        local.clone(),
        Duration::from_secs(1),
    ));
    let pin = Arc::new(PinService::new(
        Arc::clone(&security),
        local.clone(),
        Arc::clone(&registry),
        transport,
        None,
        events,
        Duration::from_secs(600),
        Duration::from_secs(1),
    ));
    let preview = Arc::new(PreviewService::new(
        Arc::clone(&index),
        Arc::clone(&security),
        PreviewSettings::default(),
    ));
    (
        ServeContext {
            index,
            search,
            pin,
            preview,
            direct_chunk_size: 65_536,
        },
        security,
    )
}

fn session_pair(client_sec: &SecurityContext, server_sec: &SecurityContext) -> (ChannelSession, ChannelSession) {
    let chunk_key = blake3::derive_key("conformance session", b"fixed");
    let client_view = ChannelSession {
        remote: identity("server", server_sec),
        remote_nonce: [1u8; 32],
        remote_protocol_version: 1,
        chunk_key,
    };
    let server_view = ChannelSession {
        remote: identity("client", client_sec),
        remote_nonce: [2u8; 32],
        remote_protocol_version: 1,
        chunk_key,
    };
    (client_view, server_view)
}

fn share_bytes(index: &ShareIndex, dir: &Path, name: &str, bytes: &[u8]) -> SharedFile {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write shared fixture");
    index.add_path("shared", &path, "server").expect("index")
}

struct TransferRig {
    state: Arc<Mutex<TransferState>>,
    control: watch::Sender<TransferCommand>,
    /// Subscribed before the loop starts, so no event is missed.
    events_rx: tokio::sync::broadcast::Receiver<NodeEvent>,
    join: tokio::task::JoinHandle<()>,
    server: tokio::task::JoinHandle<()>,
    _source_dir: tempfile::TempDir,
}

/// Wire a real serving loop to a real download loop over a duplex pipe.
/// `premarked` chunks are written into the part file before the loop
/// starts, simulating a killed-and-restarted process. `initial` is the
/// starting control command; `Pause` holds the loop at the first chunk
/// boundary so tests can interleave deterministically.
async fn start_transfer(
    source_bytes: &[u8],
    download_dir: &Path,
    premarked: &[u32],
    initial: TransferCommand,
) -> TransferRig {
    let source_dir = tempfile::tempdir().expect("source dir");
    let index = Arc::new(ShareIndex::new());
    let shared = share_bytes(&index, source_dir.path(), "notes.txt", source_bytes);

    let (ctx, server_sec) = serve_context(Arc::clone(&index), 100);
    let client_sec = security(101);
    let (client_session, server_session) = session_pair(&client_sec, &server_sec);

    let (mut client_io, mut server_io) = tokio::io::duplex(1024 * 1024);
    let server = tokio::spawn(async move {
        let _ = serve_connection(&mut server_io, &server_session, &ctx).await;
    });

    // metadata exchange, as download_direct would perform
    write_message(
        &mut client_io,
        &Message::ReqMetadata(MetadataRequest {
            path: shared.file_hash.to_hex(),
        }),
    )
    .await
    .expect("send metadata request");
    let metadata = match read_message(&mut client_io).await.expect("metadata reply") {
        Message::RespMetadata(metadata) => metadata,
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(metadata.file_size, source_bytes.len() as u64);

    let mut state = TransferState::new(
        client_session.remote.clone(),
        metadata.file_name.clone(),
        shared.file_hash.to_hex(),
        metadata.file_size,
        Some(shared.file_hash),
        metadata.chunk_size,
        download_dir.to_path_buf(),
    );

    let part = if premarked.is_empty() {
        PartFile::create(&state.part_path(), state.file_size).expect("part")
    } else {
        let mut part = PartFile::create(&state.part_path(), state.file_size).expect("part");
        for &index in premarked {
            let offset = index as u64 * metadata.chunk_size as u64;
            let end = ((offset + metadata.chunk_size as u64) as usize).min(source_bytes.len());
            part.write_chunk(offset, &source_bytes[offset as usize..end])
                .expect("premark chunk bytes");
            state.mark_chunk(index).expect("premark state");
        }
        part
    };

    let state = Arc::new(Mutex::new(state));
    let (control_tx, control_rx) = watch::channel(initial);
    let events = EventBus::new(256);
    let events_rx = events.subscribe();
    let tuning = EngineTuning::from(&NodeConfig::default());

    let loop_state = Arc::clone(&state);
    let chunk_key = client_session.chunk_key;
    let join = tokio::spawn(async move {
        run_transfer_loop(
            client_io,
            chunk_key,
            loop_state,
            part,
            control_rx,
            events,
            tuning,
        )
        .await;
    });

    TransferRig {
        state,
        control: control_tx,
        events_rx,
        join,
        server,
        _source_dir: source_dir,
    }
}

#[tokio::test]
async fn direct_transfer_completes_byte_identical() {
    // 131072 bytes of "abcd" at 65536-byte chunks: exactly two chunks
    let source: Vec<u8> = b"abcd".repeat(32_768);
    assert_eq!(source.len(), 131_072);
    let download = tempfile::tempdir().expect("download dir");

    let mut rig = start_transfer(&source, download.path(), &[], TransferCommand::Run).await;

    let part_path = rig.state.lock().expect("state").part_path();
    let final_path = rig.state.lock().expect("state").final_path();

    rig.join.await.expect("loop join");
    rig.server.abort();

    // two committed chunks, two progress events
    let mut progress_events = 0;
    let mut completed = false;
    while let Ok(event) = rig.events_rx.try_recv() {
        match event {
            NodeEvent::TransferProgress { .. } => progress_events += 1,
            NodeEvent::TransferCompleted { .. } => completed = true,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(progress_events, 2);
    assert!(completed);

    let guard = rig.state.lock().expect("state");
    assert_eq!(guard.status(), TransferStatus::Completed);
    assert_eq!(guard.bytes_transferred, 131_072);
    assert_eq!(guard.received().cardinality(), guard.total_chunks);
    drop(guard);

    // .part is gone, final bytes match the source exactly
    assert!(!part_path.exists());
    let downloaded = std::fs::read(&final_path).expect("final file");
    assert_eq!(downloaded, source);
    assert_eq!(
        FileHash::of_bytes(&downloaded),
        FileHash::of_bytes(&source)
    );
}

#[tokio::test]
async fn resume_fetches_only_missing_chunks() {
    let source: Vec<u8> = b"abcd".repeat(32_768);
    let download = tempfile::tempdir().expect("download dir");

    // chunk 0 was committed before the process died
    let mut rig = start_transfer(&source, download.path(), &[0], TransferCommand::Run).await;
    let final_path = rig.state.lock().expect("state").final_path();

    rig.join.await.expect("loop join");
    rig.server.abort();

    let mut progress_events = 0;
    while let Ok(event) = rig.events_rx.try_recv() {
        if matches!(event, NodeEvent::TransferProgress { .. }) {
            progress_events += 1;
        }
    }
    // only chunk 1 crossed the wire
    assert_eq!(progress_events, 1);
    assert_eq!(std::fs::read(&final_path).expect("final"), source);
}

#[tokio::test]
async fn pause_resume_preserves_byte_identity() {
    let source: Vec<u8> = (0..=u8::MAX).cycle().take(65_536 * 4 + 7).collect();
    let download = tempfile::tempdir().expect("download dir");

    // the loop starts held at the first chunk boundary
    let mut rig = start_transfer(&source, download.path(), &[], TransferCommand::Pause).await;
    let final_path = rig.state.lock().expect("state").final_path();

    // while paused, nothing is committed
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(rig.state.lock().expect("state").bytes_transferred, 0);
    assert!(matches!(
        rig.events_rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // resume and let it run to the end
    rig.control.send(TransferCommand::Run).expect("resume");
    rig.join.await.expect("loop join");
    rig.server.abort();

    // the paused run is byte-identical to one that never paused
    assert_eq!(
        rig.state.lock().expect("state").status(),
        TransferStatus::Completed
    );
    assert_eq!(std::fs::read(&final_path).expect("final"), source);
}

#[tokio::test]
async fn cancel_removes_part_file_and_state() {
    let source: Vec<u8> = b"xyzw".repeat(65_536); // 4 chunks
    let download = tempfile::tempdir().expect("download dir");

    // held at the first chunk boundary, then cancelled
    let rig = start_transfer(&source, download.path(), &[], TransferCommand::Pause).await;
    let part_path = rig.state.lock().expect("state").part_path();
    let state_path = rig.state.lock().expect("state").state_path();
    let final_path = rig.state.lock().expect("state").final_path();

    assert!(part_path.exists(), "part file is pre-allocated");
    rig.control.send(TransferCommand::Cancel).expect("cancel");
    rig.join.await.expect("loop join");
    rig.server.abort();

    assert_eq!(
        rig.state.lock().expect("state").status(),
        TransferStatus::Cancelled
    );
    assert!(!part_path.exists(), "cancel must remove the .part file");
    assert!(!state_path.exists(), "cancel must remove persisted state");
    assert!(!final_path.exists());
}

#[tokio::test]
async fn legacy_inline_stream_reassembles_the_file() {
    let source: Vec<u8> = b"stream".repeat(30_000);
    let source_dir = tempfile::tempdir().expect("source dir");
    let index = Arc::new(ShareIndex::new());
    let shared = share_bytes(&index, source_dir.path(), "legacy.bin", &source);

    let (ctx, server_sec) = serve_context(Arc::clone(&index), 200);
    let client_sec = security(201);
    let (client_session, server_session) = session_pair(&client_sec, &server_sec);

    let (mut client_io, mut server_io) = tokio::io::duplex(1024 * 1024);
    let server = tokio::spawn(async move {
        let _ = serve_connection(&mut server_io, &server_session, &ctx).await;
    });

    let fetched = fetch_inline_stream(
        &mut client_io,
        &client_session.chunk_key,
        &shared.file_hash.to_hex(),
    )
    .await
    .expect("inline stream");
    assert_eq!(fetched, source);
    server.abort();
}

#[tokio::test]
async fn requesting_an_unshared_file_is_refused() {
    let index = Arc::new(ShareIndex::new());
    let (ctx, server_sec) = serve_context(index, 300);
    let client_sec = security(301);
    let (_client_session, server_session) = session_pair(&client_sec, &server_sec);

    let (mut client_io, mut server_io) = tokio::io::duplex(65_536);
    let server = tokio::spawn(async move {
        let _ = serve_connection(&mut server_io, &server_session, &ctx).await;
    });

    write_message(
        &mut client_io,
        &Message::ReqMetadata(MetadataRequest {
            path: "/etc/shadow".to_owned(),
        }),
    )
    .await
    .expect("send");
    match read_message(&mut client_io).await.expect("reply") {
        Message::Err(err) => assert_eq!(err.kind, "not_found"),
        other => panic!("unexpected reply {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn zero_byte_file_transfers_in_zero_chunks() {
    let download = tempfile::tempdir().expect("download dir");
    let mut rig = start_transfer(&[], download.path(), &[], TransferCommand::Run).await;
    let final_path = rig.state.lock().expect("state").final_path();

    rig.join.await.expect("loop join");
    rig.server.abort();

    let mut progress_events = 0;
    while let Ok(event) = rig.events_rx.try_recv() {
        if matches!(event, NodeEvent::TransferProgress { .. }) {
            progress_events += 1;
        }
    }
    assert_eq!(progress_events, 0, "no chunks for an empty file");
    assert_eq!(
        rig.state.lock().expect("state").status(),
        TransferStatus::Completed
    );
    assert_eq!(std::fs::read(&final_path).expect("final").len(), 0);
}
