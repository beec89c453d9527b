// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::lookup_host;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{self, ChunkRecord, chunk_len, is_compressible};
use crate::config::NodeConfig;
use crate::error::{ErrorKind, NodeError, error_kind};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{PeerIdentity, SharedFile, SharedFileSummary};
use crate::peers::PeerRegistry;
use crate::pin::PinService;
use crate::preview::PreviewService;
use crate::relay::client::{RelayClient, RelayDownloadOptions};
use crate::search::{SearchService, ShareIndex};
use crate::security::SecurityContext;
use crate::transfer::{PartFile, PersistedTransfer, TransferState, TransferStatus};
use crate::transport::{ChannelSession, connect_channel};
use crate::wire::{
    ChunkRequest, Message, MetadataRequest, MetadataResponse, WireError, read_message,
    write_message,
};

/// Control signal polled by a download loop at chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCommand {
    Run,
    Pause,
    Cancel,
}

/// Retry and timeout knobs for one download loop.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub chunk_read_timeout: Duration,
}

impl From<&NodeConfig> for EngineTuning {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            chunk_read_timeout: config.chunk_read_timeout,
        }
    }
}

struct ControlSlot {
    control: watch::Sender<TransferCommand>,
    state: Arc<Mutex<TransferState>>,
}

/// Live handle to an in-flight download.
pub struct TransferHandle {
    pub transfer_id: String,
    control: watch::Sender<TransferCommand>,
    state: Arc<Mutex<TransferState>>,
    join: tokio::task::JoinHandle<()>,
}

impl TransferHandle {
    pub fn pause(&self) {
        self.state.lock().expect("transfer state poisoned").pause();
        let _ = self.control.send(TransferCommand::Pause);
    }

    pub fn resume(&self) {
        self.state.lock().expect("transfer state poisoned").resume();
        let _ = self.control.send(TransferCommand::Run);
    }

    pub fn cancel(&self) {
        let _ = self.control.send(TransferCommand::Cancel);
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().expect("transfer state poisoned").status()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state
            .lock()
            .expect("transfer state poisoned")
            .bytes_transferred
    }

    /// Wait for the download loop to finish and report the final status.
    pub async fn wait(self) -> TransferStatus {
        let _ = self.join.await;
        let status = self.state.lock().expect("transfer state poisoned").status();
        status
    }
}

/// What a dispatch decision produced.
pub enum DownloadOutcome {
    Direct(TransferHandle),
    /// Relayed download, already complete at this path.
    Relayed(PathBuf),
}

/// Everything the inbound connection dispatcher serves from.
pub struct ServeContext {
    pub index: Arc<ShareIndex>,
    pub search: Arc<SearchService>,
    pub pin: Arc<PinService>,
    pub preview: Arc<PreviewService>,
    pub direct_chunk_size: u32,
}

/// Serve one authenticated inbound channel until the remote hangs up.
/// Handles both the chunked command protocol and the legacy inline-stream
/// variant, selected by the first command byte of each request.
pub async fn serve_connection<S>(
    stream: &mut S,
    session: &ChannelSession,
    ctx: &ServeContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = match read_message(stream).await {
            Ok(message) => message,
            // remote closed the channel; a clean end of session
            Err(_) => return Ok(()),
        };

        match message {
            Message::ReqMetadata(request) => {
                let reply = match resolve_shared(&ctx.index, &request.path) {
                    Ok(file) => Message::RespMetadata(MetadataResponse {
                        file_name: file.logical_name.clone(),
                        file_size: file.size,
                        chunk_size: ctx.direct_chunk_size,
                        compress_hint: is_compressible(&file.logical_name),
                    }),
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            Message::ReqChunk(request) => {
                let reply = match serve_chunk(&ctx.index, &request, &session.chunk_key) {
                    Ok(record) => Message::RespChunk(record),
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            Message::StreamFile(request) => {
                // legacy sender: push metadata then every chunk unprompted
                match resolve_shared(&ctx.index, &request.path) {
                    Ok(file) => {
                        let chunk_size = ctx.direct_chunk_size;
                        write_message(
                            stream,
                            &Message::RespMetadata(MetadataResponse {
                                file_name: file.logical_name.clone(),
                                file_size: file.size,
                                chunk_size,
                                compress_hint: is_compressible(&file.logical_name),
                            }),
                        )
                        .await?;
                        let total = codec::total_chunks(file.size, chunk_size as usize);
                        for index in 0..total {
                            let record = serve_chunk(
                                &ctx.index,
                                &ChunkRequest {
                                    path: request.path.clone(),
                                    chunk_index: index,
                                    chunk_size,
                                },
                                &session.chunk_key,
                            )?;
                            write_message(stream, &Message::RespChunk(record)).await?;
                        }
                    }
                    Err(err) => {
                        write_message(stream, &Message::Err(wire_error(&err))).await?;
                    }
                }
            }
            Message::SearchRequest(request) => {
                let response =
                    ctx.search
                        .handle_request(request, Some(session.remote.peer_id.as_str()));
                write_message(stream, &Message::SearchResponse(response)).await?;
            }
            Message::SearchResponse(response) => {
                ctx.search.handle_forwarded_response(response);
                write_message(stream, &Message::Ok).await?;
            }
            Message::PinAnnounce(announce) => {
                let reply = match ctx.pin.handle_announce(announce) {
                    Ok(()) => Message::Ok,
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            Message::PinCancel(cancel) => {
                let reply = match ctx.pin.handle_cancel(cancel) {
                    Ok(()) => Message::Ok,
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            Message::GetManifest(request) => {
                let reply = match ctx.preview.handle_get_manifest(request.file_hash) {
                    Ok(manifest) => Message::Manifest(manifest),
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            Message::GetContent(request) => {
                let reply = match ctx.preview.handle_get_content(
                    request.file_hash,
                    request.kind,
                    &session.remote.peer_id,
                ) {
                    Ok(content) => Message::Content(content),
                    Err(err) => Message::Err(wire_error(&err)),
                };
                write_message(stream, &reply).await?;
            }
            other => {
                warn!(command = other.command(), "unexpected command on serving channel");
                write_message(
                    stream,
                    &Message::Err(WireError {
                        kind: "protocol".to_owned(),
                        reason: format!("unexpected command 0x{:02x}", other.command()),
                    }),
                )
                .await?;
                anyhow::bail!(NodeError::protocol("unexpected command on serving channel"));
            }
        }
    }
}

fn resolve_shared(index: &ShareIndex, reference: &str) -> anyhow::Result<SharedFile> {
    index
        .resolve_request(reference)
        .ok_or_else(|| NodeError::not_found(format!("no shared file matches {reference}")).into())
}

fn serve_chunk(
    index: &ShareIndex,
    request: &ChunkRequest,
    chunk_key: &[u8; 32],
) -> anyhow::Result<ChunkRecord> {
    if request.chunk_size == 0 {
        anyhow::bail!(NodeError::protocol("chunk size must be positive"));
    }
    let file = resolve_shared(index, &request.path)?;
    let total = codec::total_chunks(file.size, request.chunk_size as usize);
    if request.chunk_index >= total {
        anyhow::bail!(NodeError::protocol(format!(
            "chunk {} out of range ({total} total)",
            request.chunk_index
        )));
    }

    let len = chunk_len(request.chunk_index, request.chunk_size as usize, file.size);
    let offset = request.chunk_index as u64 * request.chunk_size as u64;
    let mut handle = std::fs::File::open(&file.local_path)
        .with_context(|| format!("open shared file {}", file.local_path.display()))?;
    handle.seek(SeekFrom::Start(offset))?;
    let mut plaintext = vec![0u8; len];
    handle.read_exact(&mut plaintext)?;

    codec::encode_chunk(
        request.chunk_index,
        &plaintext,
        is_compressible(&file.logical_name),
        chunk_key,
    )
}

fn wire_error(err: &anyhow::Error) -> WireError {
    match error_kind(err) {
        ErrorKind::NotFound => WireError::not_found(err.to_string()),
        ErrorKind::Permission => WireError::forbidden(err.to_string()),
        _ => WireError::io(err.to_string()),
    }
}

/// Client-side transfer engine: dispatch policy, the resumable download
/// loop, and bookkeeping of active transfers.
pub struct TransferEngine {
    security: Arc<SecurityContext>,
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    config: NodeConfig,
    relay: Option<Arc<RelayClient>>,
    active: Mutex<HashMap<String, ControlSlot>>,
}

impl TransferEngine {
    pub fn new(
        security: Arc<SecurityContext>,
        local: PeerIdentity,
        registry: Arc<PeerRegistry>,
        events: EventBus,
        config: NodeConfig,
        relay: Option<Arc<RelayClient>>,
    ) -> Self {
        Self {
            security,
            local,
            registry,
            events,
            config,
            relay,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch per policy: a relay-only peer (or `force_relay`) goes via
    /// the relay when a ref exists; everything else goes direct.
    pub async fn download(
        self: &Arc<Self>,
        peer: PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<DownloadOutcome> {
        let relay_eligible = file.relay_ref.is_some() && self.relay.is_some();
        if self.config.force_relay || (peer.is_relay_only() && relay_eligible) {
            if !relay_eligible {
                anyhow::bail!(NodeError::not_found(
                    "peer unreachable and no relay ref available",
                ));
            }
            let path = self.download_via_relay(&peer, file).await?;
            return Ok(DownloadOutcome::Relayed(path));
        }
        let handle = self.download_direct(peer, file).await?;
        Ok(DownloadOutcome::Direct(handle))
    }

    /// Race the direct path against `p2p_timeout`; on timeout or error,
    /// switch to the relay when a ref is available.
    pub async fn download_with_fallback(
        self: &Arc<Self>,
        peer: PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<DownloadOutcome> {
        let relay_eligible = file.relay_ref.is_some() && self.relay.is_some();
        if self.config.prefer_p2p && !self.config.force_relay && !peer.is_relay_only() {
            match tokio::time::timeout(
                self.config.p2p_timeout,
                self.download_direct(peer.clone(), file),
            )
            .await
            {
                Ok(Ok(handle)) => return Ok(DownloadOutcome::Direct(handle)),
                Ok(Err(err)) if !relay_eligible => return Err(err),
                Err(_) if !relay_eligible => {
                    anyhow::bail!(NodeError::timeout("direct path timed out, no relay ref"));
                }
                Ok(Err(err)) => {
                    info!(peer = %peer.peer_id, error = %err, "direct path failed, falling back to relay");
                }
                Err(_) => {
                    info!(peer = %peer.peer_id, "direct path timed out, falling back to relay");
                }
            }
        } else if !relay_eligible {
            anyhow::bail!(NodeError::not_found(
                "peer unreachable and no relay ref available",
            ));
        }
        let path = self.download_via_relay(&peer, file).await?;
        Ok(DownloadOutcome::Relayed(path))
    }

    async fn download_via_relay(
        &self,
        peer: &PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<PathBuf> {
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| NodeError::not_found("no relay configured"))?;
        let reference = file
            .relay_ref
            .as_ref()
            .ok_or_else(|| NodeError::not_found("file has no relay ref"))?;
        let destination = self.config.download_dir.join(&reference.file_name);
        std::fs::create_dir_all(&self.config.download_dir)?;

        let transfer_id = uuid::Uuid::new_v4().to_string();
        let events = self.events.clone();
        let progress_id = transfer_id.clone();
        let options = RelayDownloadOptions {
            // the advertised key travels with the peer identity; a
            // synthetic relay peer carries the zero key and only works
            // for unencrypted refs
            owner_public_key: (!peer.is_relay_only()).then_some(peer.public_key).or_else(|| {
                self.registry.pinned_key(&reference.sender_id)
            }),
            // relay-hosted refs skip verification by default
            verify_hash: false,
        };
        relay
            .download_file(
                reference,
                &destination,
                &options,
                Some(&move |received, total| {
                    events.emit(NodeEvent::TransferProgress {
                        transfer_id: progress_id.clone(),
                        bytes_transferred: received,
                        total_bytes: total,
                    });
                }),
            )
            .await?;
        self.events.emit(NodeEvent::TransferCompleted {
            transfer_id,
            path: destination.clone(),
        });
        Ok(destination)
    }

    /// Open an authenticated channel to the peer, fetch metadata, build or
    /// resume the transfer state, and spawn the chunk loop.
    pub async fn download_direct(
        self: &Arc<Self>,
        peer: PeerIdentity,
        file: &SharedFileSummary,
    ) -> anyhow::Result<TransferHandle> {
        let addr = lookup_host((peer.host.as_str(), peer.port))
            .await?
            .next()
            .ok_or_else(|| NodeError::transport(format!("no address for {}", peer.host)))?;
        let pinned = self.registry.pinned_key(&peer.peer_id);
        let (mut stream, session) = tokio::time::timeout(
            self.config.connection_timeout,
            connect_channel(addr, &self.security, &self.local, pinned),
        )
        .await
        .map_err(|_| NodeError::timeout("connect timed out"))??;

        let remote_ref = file.file_hash.to_hex();
        write_message(
            &mut stream,
            &Message::ReqMetadata(MetadataRequest {
                path: remote_ref.clone(),
            }),
        )
        .await?;
        let metadata = match tokio::time::timeout(
            self.config.chunk_read_timeout,
            read_message(&mut stream),
        )
        .await
        .map_err(|_| NodeError::timeout("metadata read timed out"))??
        {
            Message::RespMetadata(metadata) => metadata,
            Message::Err(err) => anyhow::bail!(err.to_node_error()),
            other => anyhow::bail!(NodeError::protocol(format!(
                "expected metadata, got command 0x{:02x}",
                other.command()
            ))),
        };

        let state = self.build_state(&peer, file, &metadata, remote_ref)?;
        let part = self.open_part(&state)?;
        let state = Arc::new(Mutex::new(state));
        self.spawn_loop(stream, session, state, part).await
    }

    fn build_state(
        &self,
        peer: &PeerIdentity,
        file: &SharedFileSummary,
        metadata: &MetadataResponse,
        remote_ref: String,
    ) -> anyhow::Result<TransferState> {
        let fresh = TransferState::new(
            peer.clone(),
            metadata.file_name.clone(),
            remote_ref,
            metadata.file_size,
            Some(file.file_hash),
            metadata.chunk_size,
            self.config.download_dir.clone(),
        );

        if !self.config.enable_resume {
            return Ok(fresh);
        }
        let state_path = fresh.state_path();
        if !state_path.exists() || !fresh.part_path().exists() {
            return Ok(fresh);
        }
        match PersistedTransfer::load(&state_path) {
            Ok(persisted)
                if persisted.file_size == metadata.file_size
                    && persisted.peer_id == peer.peer_id =>
            {
                info!(file = %metadata.file_name, "resuming interrupted transfer");
                Ok(TransferState::from_persisted(
                    persisted,
                    peer.clone(),
                    metadata.chunk_size,
                    self.config.download_dir.clone(),
                ))
            }
            _ => Ok(fresh),
        }
    }

    fn open_part(&self, state: &TransferState) -> anyhow::Result<PartFile> {
        let part_path = state.part_path();
        if state.received().cardinality() > 0 {
            PartFile::open_existing(&part_path, state.file_size)
        } else {
            PartFile::create(&part_path, state.file_size)
        }
    }

    async fn spawn_loop(
        self: &Arc<Self>,
        stream: crate::transport::ClientChannel,
        session: ChannelSession,
        state: Arc<Mutex<TransferState>>,
        part: PartFile,
    ) -> anyhow::Result<TransferHandle> {
        let (control_tx, control_rx) = watch::channel(TransferCommand::Run);
        let transfer_id = state.lock().expect("transfer state poisoned").transfer_id.clone();

        self.active.lock().expect("active transfers poisoned").insert(
            transfer_id.clone(),
            ControlSlot {
                control: control_tx.clone(),
                state: Arc::clone(&state),
            },
        );

        let engine = Arc::clone(self);
        let loop_state = Arc::clone(&state);
        let tuning = EngineTuning::from(&self.config);
        let events = self.events.clone();
        let loop_id = transfer_id.clone();
        let join = tokio::spawn(async move {
            run_transfer_loop(
                stream,
                session.chunk_key,
                loop_state,
                part,
                control_rx,
                events,
                tuning,
            )
            .await;
            engine
                .active
                .lock()
                .expect("active transfers poisoned")
                .remove(&loop_id);
        });

        Ok(TransferHandle {
            transfer_id,
            control: control_tx,
            state,
            join,
        })
    }

    pub fn pause(&self, transfer_id: &str) {
        if let Some(slot) = self
            .active
            .lock()
            .expect("active transfers poisoned")
            .get(transfer_id)
        {
            slot.state.lock().expect("transfer state poisoned").pause();
            let _ = slot.control.send(TransferCommand::Pause);
        }
    }

    pub fn resume(&self, transfer_id: &str) {
        if let Some(slot) = self
            .active
            .lock()
            .expect("active transfers poisoned")
            .get(transfer_id)
        {
            slot.state.lock().expect("transfer state poisoned").resume();
            let _ = slot.control.send(TransferCommand::Run);
        }
    }

    pub fn cancel(&self, transfer_id: &str) {
        if let Some(slot) = self
            .active
            .lock()
            .expect("active transfers poisoned")
            .get(transfer_id)
        {
            let _ = slot.control.send(TransferCommand::Cancel);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active transfers poisoned").len()
    }
}

/// The sequential chunk loop of one download. Chunks are requested in
/// ascending index order with no concurrent fetches; pause waits on the
/// control channel (no sleep-polling) and cancellation takes effect at
/// the next chunk boundary.
pub(crate) async fn run_transfer_loop<S>(
    mut stream: S,
    chunk_key: [u8; 32],
    state: Arc<Mutex<TransferState>>,
    mut part: PartFile,
    mut control: watch::Receiver<TransferCommand>,
    events: EventBus,
    tuning: EngineTuning,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (transfer_id, remote_ref, chunk_size, file_size, total_bytes, missing) = {
        let mut guard = state.lock().expect("transfer state poisoned");
        guard.start();
        (
            guard.transfer_id.clone(),
            guard.remote_ref.clone(),
            guard.chunk_size,
            guard.file_size,
            guard.file_size,
            guard.received().clear_indices().collect::<Vec<_>>(),
        )
    };

    for index in missing {
        // control gate: pause blocks here, cancel exits at the boundary
        loop {
            let command = *control.borrow();
            match command {
                TransferCommand::Run => break,
                TransferCommand::Pause => {
                    if control.changed().await.is_err() {
                        finish_cancelled(&state, part);
                        return;
                    }
                }
                TransferCommand::Cancel => {
                    finish_cancelled(&state, part);
                    return;
                }
            }
        }

        match fetch_chunk(
            &mut stream,
            &chunk_key,
            &remote_ref,
            index,
            chunk_size,
            file_size,
            &tuning,
        )
        .await
        {
            Ok(plaintext) => {
                let offset = index as u64 * chunk_size as u64;
                if let Err(err) = part.write_chunk(offset, &plaintext) {
                    finish_failed(&state, &events, &transfer_id, &err);
                    return;
                }
                let bytes_transferred = {
                    let mut guard = state.lock().expect("transfer state poisoned");
                    if guard.mark_chunk(index).is_err() {
                        // out-of-range index cannot happen for indices we
                        // generated; treat as corrupted session
                        drop(guard);
                        let err = anyhow::Error::new(NodeError::protocol("chunk accounting broke"));
                        finish_failed(&state, &events, &transfer_id, &err);
                        return;
                    }
                    let persisted = guard.persisted();
                    let state_path = guard.state_path();
                    let bytes = guard.bytes_transferred;
                    drop(guard);
                    if let Err(err) = persisted.save(&state_path) {
                        debug!(error = %err, "failed to persist transfer sidecar");
                    }
                    bytes
                };
                events.emit(NodeEvent::TransferProgress {
                    transfer_id: transfer_id.clone(),
                    bytes_transferred,
                    total_bytes,
                });
            }
            Err(err) => {
                finish_failed(&state, &events, &transfer_id, &err);
                return;
            }
        }
    }

    // all chunks committed: seal the transfer
    let final_path = {
        let mut guard = state.lock().expect("transfer state poisoned");
        if guard.complete().is_err() {
            drop(guard);
            let err = anyhow::Error::new(NodeError::protocol("bitset not full at completion"));
            finish_failed(&state, &events, &transfer_id, &err);
            return;
        }
        guard.final_path()
    };
    let state_path = state.lock().expect("transfer state poisoned").state_path();
    match part.finalize(&final_path) {
        Ok(()) => {
            PersistedTransfer::remove(&state_path);
            info!(transfer_id = %transfer_id, path = %final_path.display(), "transfer complete");
            events.emit(NodeEvent::TransferCompleted {
                transfer_id,
                path: final_path,
            });
        }
        Err(err) => finish_failed(&state, &events, &transfer_id, &err),
    }
}

/// Request one chunk, retrying transient transport failures. Integrity
/// failures abort immediately: a bad tag will not get better on retry
/// against the same session.
async fn fetch_chunk<S>(
    stream: &mut S,
    chunk_key: &[u8; 32],
    remote_ref: &str,
    index: u32,
    chunk_size: u32,
    file_size: u64,
    tuning: &EngineTuning,
) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected_len = chunk_len(index, chunk_size as usize, file_size);
    let mut attempt = 0;
    loop {
        let result = fetch_chunk_once(
            stream,
            chunk_key,
            remote_ref,
            index,
            chunk_size,
            expected_len,
            tuning.chunk_read_timeout,
        )
        .await;
        match result {
            Ok(plaintext) => return Ok(plaintext),
            Err(err) => {
                let kind = error_kind(&err);
                let retryable = matches!(kind, ErrorKind::Transport | ErrorKind::Timeout);
                if !retryable || attempt + 1 >= tuning.max_retries {
                    return Err(err.context(format!("chunk {index} failed")));
                }
                attempt += 1;
                warn!(chunk = index, attempt, error = %err, "chunk fetch failed, retrying");
                tokio::time::sleep(tuning.retry_delay).await;
            }
        }
    }
}

async fn fetch_chunk_once<S>(
    stream: &mut S,
    chunk_key: &[u8; 32],
    remote_ref: &str,
    index: u32,
    chunk_size: u32,
    expected_len: usize,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(
        stream,
        &Message::ReqChunk(ChunkRequest {
            path: remote_ref.to_owned(),
            chunk_index: index,
            chunk_size,
        }),
    )
    .await?;

    let reply = tokio::time::timeout(read_timeout, read_message(stream))
        .await
        .map_err(|_| NodeError::timeout(format!("chunk {index} read timed out")))??;
    let record = match reply {
        Message::RespChunk(record) => record,
        Message::Err(err) => anyhow::bail!(err.to_node_error()),
        other => anyhow::bail!(NodeError::protocol(format!(
            "expected chunk, got command 0x{:02x}",
            other.command()
        ))),
    };
    if record.chunk_index != index {
        anyhow::bail!(NodeError::protocol(format!(
            "requested chunk {index}, got {}",
            record.chunk_index
        )));
    }

    let plaintext = codec::decode_chunk(&record, chunk_key)?;
    if plaintext.len() != expected_len {
        anyhow::bail!(NodeError::integrity(format!(
            "chunk {index} decoded to {} bytes, expected {expected_len}",
            plaintext.len()
        )));
    }
    Ok(plaintext)
}

fn finish_cancelled(state: &Arc<Mutex<TransferState>>, part: PartFile) {
    let state_path = {
        let mut guard = state.lock().expect("transfer state poisoned");
        guard.cancel();
        guard.state_path()
    };
    part.discard();
    PersistedTransfer::remove(&state_path);
}

/// Terminal failure: the `.part` file and sidecar stay on disk so a later
/// attempt can resume, and `TransferFailed` fires exactly once.
fn finish_failed(
    state: &Arc<Mutex<TransferState>>,
    events: &EventBus,
    transfer_id: &str,
    err: &anyhow::Error,
) {
    {
        let mut guard = state.lock().expect("transfer state poisoned");
        if guard.status().is_terminal() {
            return;
        }
        guard.fail(err.to_string());
    }
    events.emit(NodeEvent::TransferFailed {
        transfer_id: transfer_id.to_owned(),
        kind: error_kind(err),
        reason: err.to_string(),
    });
}

/// Consume a legacy inline stream: after one `StreamFile` request the
/// remote pushes metadata and all chunks. Returns the reassembled bytes.
pub async fn fetch_inline_stream<S>(
    stream: &mut S,
    chunk_key: &[u8; 32],
    path: &str,
) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(
        stream,
        &Message::StreamFile(crate::wire::StreamFileRequest {
            path: path.to_owned(),
        }),
    )
    .await?;
    let metadata = match read_message(stream).await? {
        Message::RespMetadata(metadata) => metadata,
        Message::Err(err) => anyhow::bail!(err.to_node_error()),
        other => anyhow::bail!(NodeError::protocol(format!(
            "expected metadata, got command 0x{:02x}",
            other.command()
        ))),
    };

    let total = codec::total_chunks(metadata.file_size, metadata.chunk_size as usize);
    let mut out = Vec::with_capacity(metadata.file_size as usize);
    for index in 0..total {
        let record = match read_message(stream).await? {
            Message::RespChunk(record) => record,
            Message::Err(err) => anyhow::bail!(err.to_node_error()),
            other => anyhow::bail!(NodeError::protocol(format!(
                "expected chunk, got command 0x{:02x}",
                other.command()
            ))),
        };
        if record.chunk_index != index {
            anyhow::bail!(NodeError::protocol("stream chunks out of order"));
        }
        out.extend_from_slice(&codec::decode_chunk(&record, chunk_key)?);
    }
    Ok(out)
}
