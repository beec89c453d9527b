// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The store-and-forward relay: an HTTP server holding chunked uploads
//! with an expiry window, a peer registry, a file search index, and a
//! PIN registry. Clients encrypt content client-side when they need
//! confidentiality against the relay operator.

pub mod index;
pub mod registry;
pub mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use driftshare_core::relay::http::{
    HttpRequest, HttpResponse, parse_range_start, read_request, write_response,
    write_response_head,
};
use driftshare_core::relay::protocol::{
    ApiMessage, FileSearchResponse, HEADER_API_KEY, HEADER_CHUNK_INDEX, HEADER_FILE_NAME,
    HEADER_UPLOAD_ID, HealthStatus, PeerListResponse, PinCreateRequest, PinFindResponse,
    RegisterPeerRequest, RegisterPeerResponse, RelayPeer, UploadAck, UploadStatus,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::index::RelayIndex;
use crate::registry::RelayPeerRegistry;
use crate::store::UploadStore;

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_addr: SocketAddr,
    pub storage_dir: PathBuf,
    pub default_expiry: Duration,
    pub peer_timeout: Duration,
    pub api_key: Option<String>,
    pub upload_sweep_interval: Duration,
    pub peer_sweep_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage_dir: PathBuf::from("relay-storage"),
            default_expiry: Duration::from_secs(24 * 60 * 60),
            peer_timeout: Duration::from_secs(60),
            api_key: None,
            upload_sweep_interval: Duration::from_secs(10 * 60),
            peer_sweep_interval: Duration::from_secs(30),
        }
    }
}

pub struct RelayState {
    pub uploads: UploadStore,
    pub peers: RelayPeerRegistry,
    pub index: RelayIndex,
    api_key: Option<String>,
}

impl RelayState {
    /// One expiry pass over uploads, their index entries, and pins.
    pub fn sweep_uploads(&self, now_unix: u64) {
        let removed = self.uploads.sweep(now_unix);
        self.index.remove_uploads(&removed);
        self.index.sweep_pins(now_unix);
    }
}

pub struct RelayServer {
    config: RelayServerConfig,
}

pub struct RelayHandle {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("relay server stopped");
    }
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        Self { config }
    }

    pub async fn start(self) -> anyhow::Result<RelayHandle> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .context("bind relay listener")?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(RelayState {
            uploads: UploadStore::new(&self.config.storage_dir, self.config.default_expiry)?,
            peers: RelayPeerRegistry::new(self.config.peer_timeout),
            index: RelayIndex::new(),
            api_key: self.config.api_key.clone(),
        });
        info!(
            addr = %local_addr,
            storage = %self.config.storage_dir.display(),
            expiry_mins = self.config.default_expiry.as_secs() / 60,
            "relay server listening"
        );

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, remote_addr, state).await {
                        debug!(%remote_addr, error = %err, "connection ended with error");
                    }
                });
            }
        });

        let upload_state = Arc::clone(&state);
        let upload_interval = self.config.upload_sweep_interval;
        let upload_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(upload_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                upload_state.sweep_uploads(now_unix());
            }
        });

        let peer_state = Arc::clone(&state);
        let peer_interval = self.config.peer_sweep_interval;
        let peer_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(peer_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                peer_state.peers.sweep(now_unix());
            }
        });

        Ok(RelayHandle {
            local_addr,
            state,
            tasks: vec![accept_task, upload_sweeper, peer_sweeper],
        })
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

enum Reply {
    Buffered(HttpResponse),
    /// Stream a stored file from `start`; status is 200 or 206.
    FileStream {
        status: u16,
        path: PathBuf,
        start: u64,
        length: u64,
    },
}

async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<RelayState>,
) -> anyhow::Result<()> {
    let request = read_request(&mut stream).await?;
    debug!(%remote_addr, method = %request.method, target = %request.target, "request");

    let reply = route(&request, remote_addr, &state).unwrap_or_else(|err| {
        warn!(target = %request.target, error = %err, "handler failed");
        Reply::Buffered(HttpResponse::text(500, &format!("Internal error: {err}")))
    });

    match reply {
        Reply::Buffered(response) => write_response(&mut stream, &response).await?,
        Reply::FileStream {
            status,
            path,
            start,
            length,
        } => {
            write_response_head(
                &mut stream,
                status,
                &[(
                    "Content-Type".to_owned(),
                    "application/octet-stream".to_owned(),
                )],
                Some(length),
            )
            .await?;
            let mut file = tokio::fs::File::open(&path).await?;
            tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(start)).await?;
            let mut remaining = length;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let read = tokio::io::AsyncReadExt::read(&mut file, &mut buf[..want]).await?;
                if read == 0 {
                    break;
                }
                stream.write_all(&buf[..read]).await?;
                remaining -= read as u64;
            }
            stream.flush().await?;
        }
    }
    Ok(())
}

fn route(
    request: &HttpRequest,
    remote_addr: SocketAddr,
    state: &RelayState,
) -> anyhow::Result<Reply> {
    let path = request.path().to_owned();
    let method = request.method.as_str();

    let reply = match path.as_str() {
        "/api/relay/upload" => match method {
            "POST" => handle_upload(request, state)?,
            _ => method_not_allowed(),
        },
        "/api/relay/status/health" => match method {
            "GET" => Reply::Buffered(HttpResponse::json(
                200,
                &HealthStatus {
                    status: "healthy".to_owned(),
                    active_peers: state.peers.count(),
                    active_uploads: state.uploads.count(),
                    timestamp: now_unix(),
                },
            )),
            _ => method_not_allowed(),
        },
        "/api/peers/register" => match method {
            "POST" => handle_peer_register(request, remote_addr, state)?,
            _ => method_not_allowed(),
        },
        "/api/peers/list" => match method {
            "GET" => {
                let exclude = request.query_param("peerId");
                let peers = state.peers.list_excluding(exclude.as_deref());
                let count = peers.len();
                Reply::Buffered(HttpResponse::json(200, &PeerListResponse { peers, count }))
            }
            _ => method_not_allowed(),
        },
        "/api/peers/heartbeat" => match method {
            "POST" => {
                let Some(peer_id) = request.query_param("peerId") else {
                    return Ok(bad_request("Missing peerId"));
                };
                if state.peers.heartbeat(&peer_id, now_unix()) {
                    Reply::Buffered(HttpResponse::json(
                        200,
                        &ApiMessage {
                            success: true,
                            message: "ok".to_owned(),
                        },
                    ))
                } else {
                    Reply::Buffered(HttpResponse::text(404, "Unknown peer"))
                }
            }
            _ => method_not_allowed(),
        },
        "/api/files/register" => match method {
            "POST" => {
                let reference = request.json()?;
                state.index.register_file(reference);
                Reply::Buffered(HttpResponse::json(
                    200,
                    &ApiMessage {
                        success: true,
                        message: "File registered".to_owned(),
                    },
                ))
            }
            _ => method_not_allowed(),
        },
        "/api/files/search" => match method {
            "GET" => {
                let Some(query) = request.query_param("q") else {
                    return Ok(bad_request("Missing q"));
                };
                let exclude = request.query_param("excludeSender");
                let files = state.index.search(&query, exclude.as_deref());
                let count = files.len();
                Reply::Buffered(HttpResponse::json(200, &FileSearchResponse { files, count }))
            }
            _ => method_not_allowed(),
        },
        "/api/pin/create" => match method {
            "POST" => {
                let body: PinCreateRequest = request.json()?;
                if body.pin.len() != 6 || !body.pin.chars().all(|c| c.is_ascii_digit()) {
                    return Ok(bad_request("PIN must be six digits"));
                }
                let expires_at_unix = now_unix() + body.expiry_ms / 1000;
                state.index.create_pin(&body.pin, body.file, expires_at_unix);
                Reply::Buffered(HttpResponse::json(
                    200,
                    &ApiMessage {
                        success: true,
                        message: "PIN created".to_owned(),
                    },
                ))
            }
            _ => method_not_allowed(),
        },
        "/api/pin/find" => match method {
            "GET" => {
                let Some(pin) = request.query_param("pin") else {
                    return Ok(bad_request("Missing pin"));
                };
                let found = state.index.find_pin(&pin, now_unix());
                Reply::Buffered(HttpResponse::json(
                    200,
                    &PinFindResponse {
                        found: found.is_some(),
                        file: found,
                    },
                ))
            }
            _ => method_not_allowed(),
        },
        _ if path.starts_with("/api/relay/download/") => match method {
            "GET" => handle_download(request, &path, state)?,
            _ => method_not_allowed(),
        },
        _ if path.starts_with("/api/relay/status/") => match method {
            "GET" => handle_status(&path, state)?,
            _ => method_not_allowed(),
        },
        _ => Reply::Buffered(HttpResponse::text(404, "Not Found")),
    };
    Ok(reply)
}

fn method_not_allowed() -> Reply {
    Reply::Buffered(HttpResponse::text(405, "Method Not Allowed"))
}

fn bad_request(reason: &str) -> Reply {
    Reply::Buffered(HttpResponse::text(400, reason))
}

fn handle_upload(request: &HttpRequest, state: &RelayState) -> anyhow::Result<Reply> {
    if let Some(expected) = &state.api_key {
        if request.header(HEADER_API_KEY) != Some(expected.as_str()) {
            return Ok(Reply::Buffered(HttpResponse::text(401, "Bad API key")));
        }
    }

    let (Some(upload_id), Some(file_name), Some(chunk_index)) = (
        request.header(HEADER_UPLOAD_ID),
        request.header(HEADER_FILE_NAME),
        request.header(HEADER_CHUNK_INDEX),
    ) else {
        return Ok(bad_request("Missing headers"));
    };
    let Ok(chunk_index) = chunk_index.parse::<u32>() else {
        return Ok(bad_request("Bad chunk index"));
    };

    let session = state.uploads.append_chunk(
        upload_id,
        file_name,
        chunk_index,
        &request.body,
        now_unix(),
    )?;
    Ok(Reply::Buffered(HttpResponse::json(
        200,
        &UploadAck {
            upload_id: session.upload_id,
            chunk_index,
            status: "ok".to_owned(),
        },
    )))
}

fn handle_download(request: &HttpRequest, path: &str, state: &RelayState) -> anyhow::Result<Reply> {
    let upload_id = path.trim_start_matches("/api/relay/download/");
    let Some(session) = state.uploads.get(upload_id) else {
        return Ok(Reply::Buffered(HttpResponse::text(404, "File not found")));
    };
    if session.is_expired(now_unix()) {
        return Ok(Reply::Buffered(HttpResponse::text(410, "File expired")));
    }
    let Ok(metadata) = std::fs::metadata(&session.file_path) else {
        return Ok(Reply::Buffered(HttpResponse::text(404, "File not found")));
    };
    let file_size = metadata.len();

    let start = request
        .header("Range")
        .and_then(parse_range_start)
        .unwrap_or(0);
    if start > file_size {
        return Ok(bad_request("Range beyond end of file"));
    }
    let status = if start > 0 { 206 } else { 200 };
    Ok(Reply::FileStream {
        status,
        path: session.file_path.clone(),
        start,
        length: file_size - start,
    })
}

fn handle_status(path: &str, state: &RelayState) -> anyhow::Result<Reply> {
    let upload_id = path.trim_start_matches("/api/relay/status/");
    let Some(session) = state.uploads.get(upload_id) else {
        return Ok(Reply::Buffered(HttpResponse::text(404, "Upload not found")));
    };
    Ok(Reply::Buffered(HttpResponse::json(
        200,
        &UploadStatus {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            uploaded_size: session.stored_size,
            chunks: session.received_chunks.len() as u32,
            expired: session.is_expired(now_unix()),
            // the upload headers never declare a total size or chunk
            // count, so the server cannot observe completion; only the
            // sender knows when the last chunk has landed
            complete: false,
        },
    )))
}

fn handle_peer_register(
    request: &HttpRequest,
    remote_addr: SocketAddr,
    state: &RelayState,
) -> anyhow::Result<Reply> {
    let body: RegisterPeerRequest = request.json()?;
    let public_ip = if body.public_ip == "auto" {
        remote_addr.ip().to_string()
    } else {
        body.public_ip.clone()
    };
    state.peers.register(
        RelayPeer {
            peer_id: body.peer_id,
            display_name: body.display_name,
            ip_address: public_ip.clone(),
            port: body.port,
            public_key: body.public_key,
        },
        now_unix(),
    );
    Ok(Reply::Buffered(HttpResponse::json(
        200,
        &RegisterPeerResponse {
            success: true,
            message: "Peer registered".to_owned(),
            public_ip,
        },
    )))
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;

    fn state(dir: &Path) -> RelayState {
        RelayState {
            uploads: UploadStore::new(dir, Duration::from_secs(3600)).expect("store"),
            peers: RelayPeerRegistry::new(Duration::from_secs(60)),
            index: RelayIndex::new(),
            api_key: None,
        }
    }

    fn chunk_request(upload_id: &str, chunk_index: u32, body: &[u8]) -> HttpRequest {
        HttpRequest::new("POST", "/api/relay/upload")
            .with_header(HEADER_UPLOAD_ID, upload_id)
            .with_header(HEADER_FILE_NAME, "big.bin")
            .with_header(HEADER_CHUNK_INDEX, chunk_index.to_string())
            .with_body(body.to_vec())
    }

    fn status_of(state: &RelayState, upload_id: &str) -> UploadStatus {
        let reply = handle_status(&format!("/api/relay/status/{upload_id}"), state)
            .expect("status handler");
        match reply {
            Reply::Buffered(response) => {
                assert_eq!(response.status, 200);
                response.json_body().expect("status json")
            }
            Reply::FileStream { .. } => panic!("status must not stream"),
        }
    }

    #[test]
    fn status_never_reports_complete_without_a_declared_total() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path());

        // two of five chunks have landed
        for index in 0..2u32 {
            handle_upload(&chunk_request("up-partial", index, &[7u8; 1024]), &state)
                .expect("chunk accepted");
        }
        let status = status_of(&state, "up-partial");
        assert_eq!(status.chunks, 2);
        assert_eq!(status.uploaded_size, 2048);
        assert!(!status.complete, "a partial upload must not report complete");

        // the rest arrive; nothing on the wire declares a total, so the
        // server still cannot claim completion
        for index in 2..5u32 {
            handle_upload(&chunk_request("up-partial", index, &[7u8; 1024]), &state)
                .expect("chunk accepted");
        }
        let status = status_of(&state, "up-partial");
        assert_eq!(status.chunks, 5);
        assert_eq!(status.uploaded_size, 5 * 1024);
        assert!(!status.complete);
    }

    #[test]
    fn status_for_unknown_upload_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path());
        let reply = handle_status("/api/relay/status/up-ghost", &state).expect("handler");
        match reply {
            Reply::Buffered(response) => assert_eq!(response.status, 404),
            Reply::FileStream { .. } => panic!("status must not stream"),
        }
    }
}
