// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::NodeError;
use crate::identity::{FileHash, PeerIdentity};
use crate::pin::PinRelay;
use crate::relay::http::{
    self, HttpRequest, HttpResponse, encode_query_component, parse_url, read_response_head,
    write_request,
};
use crate::relay::protocol::{
    ApiMessage, FileSearchResponse, HEADER_API_KEY, HEADER_CHUNK_INDEX, HEADER_FILE_NAME,
    HEADER_SENDER_ID, HEADER_UPLOAD_ID, PeerListResponse, PinCreateRequest, PinFindResponse,
    RegisterPeerRequest, RegisterPeerResponse, RelayFileRef, RelayPeer, UploadStatus,
};
use crate::security::SecurityContext;
use crate::transport::now_unix_secs;

pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[derive(Debug, Clone)]
pub struct RelayUploadRequest {
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_public_key: [u8; 32],
    pub recipient_id: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RelayDownloadOptions {
    /// Owner's advertised public key, required to decrypt an
    /// `encrypted: true` blob.
    pub owner_public_key: Option<[u8; 32]>,
    /// Verify the final bytes against the ref's hash. Callers may skip
    /// this for relay-hosted files whose server-side append order makes
    /// the digest unreliable.
    pub verify_hash: bool,
}

/// HTTP client for the store-and-forward relay: chunked uploads with
/// retry, resumable downloads, and the peer / search / PIN registries.
pub struct RelayClient {
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn decorate(&self, mut request: HttpRequest) -> HttpRequest {
        if let Some(api_key) = &self.config.api_key {
            request = request.with_header(HEADER_API_KEY, api_key.clone());
        }
        request
    }

    /// One buffered request/response exchange against the relay.
    async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let (host, port, _) = parse_url(self.config.base_url())?;
        let request = self.decorate(request);
        let exchange = async {
            let mut stream = TcpStream::connect((host.as_str(), port)).await?;
            write_request(&mut stream, &host, &request).await?;
            http::read_response(&mut stream).await
        };
        tokio::time::timeout(self.config.upload_timeout, exchange)
            .await
            .map_err(|_| NodeError::timeout(format!("relay request {} timed out", request.target)))?
    }

    fn status_error(status: u16, what: &str) -> anyhow::Error {
        match status {
            404 => NodeError::not_found(format!("{what}: not found")).into(),
            410 => NodeError::not_found(format!("{what}: expired")).into(),
            401 => NodeError::permission(format!("{what}: api key rejected")).into(),
            other => NodeError::transport(format!("{what}: relay returned {other}")).into(),
        }
    }

    // ---- upload -----------------------------------------------------

    /// Upload a file in relay-sized chunks. With encryption enabled the
    /// whole file is sealed client-side first, so the relay operator only
    /// ever stores ciphertext.
    pub async fn upload_file(
        &self,
        source: &Path,
        request: &RelayUploadRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<RelayFileRef> {
        let file_hash = FileHash::of_file(source)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned());

        let (blob_path, encrypted, temp_guard) = if self.config.enable_encryption {
            let key = SecurityContext::relay_blob_key(&request.sender_public_key, &upload_id);
            let plain = tokio::fs::read(source)
                .await
                .with_context(|| format!("read {} for relay upload", source.display()))?;
            let sealed = SecurityContext::seal(&key, &plain)?;
            let temp = std::env::temp_dir().join(format!("driftshare-{upload_id}.sealed"));
            tokio::fs::write(&temp, &sealed).await?;
            (temp.clone(), true, Some(temp))
        } else {
            (source.to_path_buf(), false, None)
        };

        let result = self
            .upload_chunks(&blob_path, &upload_id, &file_name, request, progress)
            .await;
        if let Some(temp) = temp_guard {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result?;

        info!(upload_id = %upload_id, file = %file_name, "relay upload complete");
        Ok(RelayFileRef {
            upload_id: upload_id.clone(),
            file_name,
            file_size: std::fs::metadata(source)?.len(),
            file_hash: Some(file_hash.to_hex()),
            download_url: self.config.download_url(&upload_id),
            sender_id: request.sender_id.clone(),
            sender_name: request.sender_name.clone(),
            recipient_id: request.recipient_id.clone(),
            encrypted,
            encryption_algorithm: encrypted.then(|| "chacha20poly1305".to_owned()),
            mime_type: request.mime_type.clone(),
            expires_at_unix: Some(now_unix_secs()? + self.config.default_expiry.as_secs()),
            download_count: 0,
            max_downloads: 0,
        })
    }

    async fn upload_chunks(
        &self,
        blob_path: &Path,
        upload_id: &str,
        file_name: &str,
        request: &RelayUploadRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::open(blob_path)
            .await
            .with_context(|| format!("open {} for chunked upload", blob_path.display()))?;
        let blob_size = file.metadata().await?.len();
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut chunk_index: u32 = 0;
        let mut uploaded: u64 = 0;

        loop {
            let read = read_full_chunk(&mut file, &mut buf).await?;
            if read == 0 {
                break;
            }
            let chunk = &buf[..read];

            let mut attempt = 0;
            loop {
                match self
                    .post_chunk(upload_id, chunk_index, file_name, &request.sender_id, chunk)
                    .await
                {
                    Ok(()) => break,
                    Err(err) if attempt + 1 < self.config.max_retries => {
                        attempt += 1;
                        warn!(
                            upload_id = %upload_id,
                            chunk = chunk_index,
                            attempt,
                            error = %err,
                            "chunk upload failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("chunk {chunk_index} failed after {} attempts", attempt + 1)
                        });
                    }
                }
            }

            uploaded += read as u64;
            chunk_index += 1;
            if let Some(report) = progress {
                report(uploaded, blob_size);
            }
        }
        Ok(())
    }

    async fn post_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        file_name: &str,
        sender_id: &str,
        chunk: &[u8],
    ) -> anyhow::Result<()> {
        let request = HttpRequest::new("POST", &self.config.upload_endpoint)
            .with_header(HEADER_UPLOAD_ID, upload_id)
            .with_header(HEADER_CHUNK_INDEX, chunk_index.to_string())
            .with_header(HEADER_FILE_NAME, file_name)
            .with_header(HEADER_SENDER_ID, sender_id)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(chunk.to_vec());
        let response = self.send(request).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "chunk upload"));
        }
        Ok(())
    }

    // ---- download ---------------------------------------------------

    /// Download a relay-hosted file to `destination`, resuming from an
    /// existing `.tmp` when allowed, decrypting and optionally verifying
    /// the final bytes.
    pub async fn download_file(
        &self,
        reference: &RelayFileRef,
        destination: &Path,
        options: &RelayDownloadOptions,
        progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<()> {
        let tmp_path = PathBuf::from(format!("{}.tmp", destination.display()));
        let start_position = if self.config.enable_resume {
            tokio::fs::metadata(&tmp_path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0)
        } else {
            0
        };

        self.fetch_to_tmp(reference, &tmp_path, start_position, progress)
            .await?;

        // decrypt in place before verification: the recorded hash covers
        // the original plaintext
        if reference.encrypted {
            let Some(owner_public_key) = options.owner_public_key else {
                anyhow::bail!(NodeError::permission(
                    "encrypted relay file requires the owner's public key",
                ));
            };
            let key = SecurityContext::relay_blob_key(&owner_public_key, &reference.upload_id);
            let sealed = tokio::fs::read(&tmp_path).await?;
            let plain = SecurityContext::open(&key, &sealed)?;
            tokio::fs::write(&tmp_path, &plain).await?;
        }

        if options.verify_hash
            && let Some(expected) = reference.parsed_hash()
        {
            let actual = FileHash::of_file(&tmp_path)?;
            if actual != expected {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                anyhow::bail!(NodeError::integrity(format!(
                    "relay download hash mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        tokio::fs::rename(&tmp_path, destination)
            .await
            .with_context(|| format!("rename into {}", destination.display()))?;
        info!(upload_id = %reference.upload_id, destination = %destination.display(),
            "relay download complete");
        Ok(())
    }

    async fn fetch_to_tmp(
        &self,
        reference: &RelayFileRef,
        tmp_path: &Path,
        start_position: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<()> {
        let (host, port, path) = parse_url(&reference.download_url)?;
        let mut request = HttpRequest::new("GET", &path);
        if start_position > 0 {
            request = request.with_header("Range", format!("bytes={start_position}-"));
            debug!(upload_id = %reference.upload_id, start_position, "resuming relay download");
        }
        let request = self.decorate(request);

        let stream = tokio::time::timeout(
            self.config.connection_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| NodeError::timeout("relay connect timed out"))??;
        let mut stream = stream;
        write_request(&mut stream, &host, &request).await?;

        let mut reader = BufReader::new(stream);
        let (status, headers) = read_response_head(&mut reader).await?;
        let (mut file, mut received) = match status {
            // whole body; any partial tmp content is stale
            200 => (tokio::fs::File::create(tmp_path).await?, 0u64),
            206 => {
                let file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(tmp_path)
                    .await?;
                (file, start_position)
            }
            other => return Err(Self::status_error(other, "relay download")),
        };

        let total = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, value)| value.parse::<u64>().ok())
            .map(|remaining| remaining + received)
            .unwrap_or(reference.file_size);

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = tokio::time::timeout(self.config.download_timeout, reader.read(&mut buf))
                .await
                .map_err(|_| NodeError::timeout("relay download stalled"))??;
            if read == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..read]).await?;
            received += read as u64;
            if let Some(report) = progress {
                report(received, total);
            }
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }

    // ---- peer registry ----------------------------------------------

    /// Register with the relay's peer registry. Returns the public IP the
    /// relay observed for us.
    pub async fn register_peer(&self, identity: &PeerIdentity) -> anyhow::Result<String> {
        let body = RegisterPeerRequest {
            peer_id: identity.peer_id.clone(),
            display_name: identity.display_name.clone(),
            public_ip: "auto".to_owned(),
            port: identity.port,
            public_key: hex::encode(identity.public_key),
        };
        let request = HttpRequest::new("POST", "/api/peers/register")
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(&body)?);
        let response = self.send(request).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "peer register"));
        }
        let parsed: RegisterPeerResponse = response.json_body()?;
        Ok(parsed.public_ip)
    }

    pub async fn list_peers(&self, exclude_peer_id: &str) -> anyhow::Result<Vec<RelayPeer>> {
        let target = format!(
            "/api/peers/list?peerId={}",
            encode_query_component(exclude_peer_id)
        );
        let response = self.send(HttpRequest::new("GET", &target)).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "peer list"));
        }
        let parsed: PeerListResponse = response.json_body()?;
        Ok(parsed.peers)
    }

    pub async fn heartbeat(&self, peer_id: &str) -> anyhow::Result<()> {
        let target = format!(
            "/api/peers/heartbeat?peerId={}",
            encode_query_component(peer_id)
        );
        let response = self.send(HttpRequest::new("POST", &target)).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "peer heartbeat"));
        }
        Ok(())
    }

    // ---- search index -----------------------------------------------

    pub async fn register_file(&self, reference: &RelayFileRef) -> anyhow::Result<()> {
        let request = HttpRequest::new("POST", "/api/files/register")
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(reference)?);
        let response = self.send(request).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "file register"));
        }
        Ok(())
    }

    pub async fn search_files(
        &self,
        query: &str,
        exclude_sender: Option<&str>,
    ) -> anyhow::Result<Vec<RelayFileRef>> {
        let mut target = format!("/api/files/search?q={}", encode_query_component(query));
        if let Some(sender) = exclude_sender {
            target.push_str(&format!("&excludeSender={}", encode_query_component(sender)));
        }
        let response = self.send(HttpRequest::new("GET", &target)).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "file search"));
        }
        let parsed: FileSearchResponse = response.json_body()?;
        Ok(parsed.files)
    }

    // ---- status -----------------------------------------------------

    pub async fn upload_status(&self, upload_id: &str) -> anyhow::Result<UploadStatus> {
        let target = format!("/api/relay/status/{upload_id}");
        let response = self.send(HttpRequest::new("GET", &target)).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "upload status"));
        }
        response.json_body()
    }
}

#[async_trait]
impl PinRelay for RelayClient {
    async fn create_pin(
        &self,
        pin: &str,
        file: &RelayFileRef,
        expiry: Duration,
    ) -> anyhow::Result<()> {
        let body = PinCreateRequest {
            pin: pin.to_owned(),
            file: file.clone(),
            expiry_ms: expiry.as_millis() as u64,
        };
        let request = HttpRequest::new("POST", "/api/pin/create")
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(&body)?);
        let response = self.send(request).await?;
        if response.status != 200 {
            return Err(Self::status_error(response.status, "pin create"));
        }
        let parsed: ApiMessage = response.json_body()?;
        if !parsed.success {
            anyhow::bail!(NodeError::transport(format!(
                "pin create rejected: {}",
                parsed.message
            )));
        }
        Ok(())
    }

    async fn find_pin(&self, pin: &str) -> anyhow::Result<Option<RelayFileRef>> {
        let target = format!("/api/pin/find?pin={}", encode_query_component(pin));
        let response = self.send(HttpRequest::new("GET", &target)).await?;
        match response.status {
            200 => {
                let parsed: PinFindResponse = response.json_body()?;
                Ok(parsed.found.then_some(parsed.file).flatten())
            }
            404 | 410 => Ok(None),
            other => Err(Self::status_error(other, "pin find")),
        }
    }
}

/// Read until the buffer is full or EOF; short reads from the middle of a
/// file must not shrink a chunk.
async fn read_full_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
