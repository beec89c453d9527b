// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::ChunkRecord;
use crate::error::NodeError;
use crate::identity::{FileHash, PeerIdentity, SharedFileSummary};
use crate::preview::{PreviewContent, PreviewKind, PreviewManifest};

/// Largest frame any channel accepts: a sealed relay-size chunk plus
/// encoding overhead.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

// Command bytes. Every request on an authenticated channel leads with one;
// the 0x00 lead byte selects the legacy inline-stream path.
pub const CMD_STREAM_FILE: u8 = 0x00;
pub const CMD_REQ_METADATA: u8 = 0x01;
pub const CMD_REQ_CHUNK: u8 = 0x02;
pub const CMD_RESP_METADATA: u8 = 0x11;
pub const CMD_RESP_CHUNK: u8 = 0x12;
pub const CMD_SEARCH_REQUEST: u8 = 0x20;
pub const CMD_SEARCH_RESPONSE: u8 = 0x21;
pub const CMD_PIN_ANNOUNCE: u8 = 0x30;
pub const CMD_PIN_CANCEL: u8 = 0x31;
pub const CMD_GET_MANIFEST: u8 = 0x40;
pub const CMD_MANIFEST: u8 = 0x41;
pub const CMD_GET_CONTENT: u8 = 0x42;
pub const CMD_CONTENT: u8 = 0x43;
pub const CMD_OK: u8 = 0x7E;
pub const CMD_ERR: u8 = 0xFF;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataResponse {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub compress_hint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRequest {
    pub path: String,
    pub chunk_index: u32,
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub request_id: String,
    pub origin: PeerIdentity,
    pub query: String,
    pub ttl: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResponse {
    pub request_id: String,
    pub source: PeerIdentity,
    pub files: Vec<SharedFileSummary>,
}

/// A PIN session as broadcast to peers. The signature covers the canonical
/// string `"PIN:" + pin + ":" + file_name` under the sender's advertised
/// key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedPinMessage {
    pub sender: PeerIdentity,
    pub pin: String,
    pub file: SharedFileSummary,
    pub created_at_unix: u64,
    pub expires_at_unix: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedPinMessage {
    pub fn signable_bytes(pin: &str, file_name: &str) -> Vec<u8> {
        format!("PIN:{pin}:{file_name}").into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinCancel {
    pub sender_id: String,
    pub pin: String,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl PinCancel {
    pub fn signable_bytes(pin: &str) -> Vec<u8> {
        format!("PINCANCEL:{pin}").into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestRequest {
    pub file_hash: FileHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRequest {
    pub file_hash: FileHash,
    pub kind: PreviewKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub kind: String,
    pub reason: String,
}

impl WireError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            kind: "not_found".to_owned(),
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            kind: "forbidden".to_owned(),
            reason: reason.into(),
        }
    }

    pub fn io(reason: impl Into<String>) -> Self {
        Self {
            kind: "io".to_owned(),
            reason: reason.into(),
        }
    }

    pub fn to_node_error(&self) -> NodeError {
        match self.kind.as_str() {
            "not_found" => NodeError::not_found(self.reason.clone()),
            "forbidden" => NodeError::permission(self.reason.clone()),
            _ => NodeError::transport(self.reason.clone()),
        }
    }
}

/// Every typed message that can cross an authenticated channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StreamFile(StreamFileRequest),
    ReqMetadata(MetadataRequest),
    RespMetadata(MetadataResponse),
    ReqChunk(ChunkRequest),
    RespChunk(ChunkRecord),
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
    PinAnnounce(SignedPinMessage),
    PinCancel(PinCancel),
    GetManifest(ManifestRequest),
    Manifest(PreviewManifest),
    GetContent(ContentRequest),
    Content(PreviewContent),
    Ok,
    Err(WireError),
}

impl Message {
    pub fn command(&self) -> u8 {
        match self {
            Self::StreamFile(_) => CMD_STREAM_FILE,
            Self::ReqMetadata(_) => CMD_REQ_METADATA,
            Self::RespMetadata(_) => CMD_RESP_METADATA,
            Self::ReqChunk(_) => CMD_REQ_CHUNK,
            Self::RespChunk(_) => CMD_RESP_CHUNK,
            Self::SearchRequest(_) => CMD_SEARCH_REQUEST,
            Self::SearchResponse(_) => CMD_SEARCH_RESPONSE,
            Self::PinAnnounce(_) => CMD_PIN_ANNOUNCE,
            Self::PinCancel(_) => CMD_PIN_CANCEL,
            Self::GetManifest(_) => CMD_GET_MANIFEST,
            Self::Manifest(_) => CMD_MANIFEST,
            Self::GetContent(_) => CMD_GET_CONTENT,
            Self::Content(_) => CMD_CONTENT,
            Self::Ok => CMD_OK,
            Self::Err(_) => CMD_ERR,
        }
    }

    pub fn encode_body(&self) -> anyhow::Result<Vec<u8>> {
        let body = match self {
            Self::StreamFile(msg) => serde_cbor::to_vec(msg)?,
            Self::ReqMetadata(msg) => serde_cbor::to_vec(msg)?,
            Self::RespMetadata(msg) => serde_cbor::to_vec(msg)?,
            Self::ReqChunk(msg) => serde_cbor::to_vec(msg)?,
            Self::RespChunk(msg) => serde_cbor::to_vec(msg)?,
            Self::SearchRequest(msg) => serde_cbor::to_vec(msg)?,
            Self::SearchResponse(msg) => serde_cbor::to_vec(msg)?,
            Self::PinAnnounce(msg) => serde_cbor::to_vec(msg)?,
            Self::PinCancel(msg) => serde_cbor::to_vec(msg)?,
            Self::GetManifest(msg) => serde_cbor::to_vec(msg)?,
            Self::Manifest(msg) => serde_cbor::to_vec(msg)?,
            Self::GetContent(msg) => serde_cbor::to_vec(msg)?,
            Self::Content(msg) => serde_cbor::to_vec(msg)?,
            Self::Ok => Vec::new(),
            Self::Err(msg) => serde_cbor::to_vec(msg)?,
        };
        Ok(body)
    }

    pub fn decode(command: u8, body: &[u8]) -> anyhow::Result<Self> {
        let message = match command {
            CMD_STREAM_FILE => Self::StreamFile(serde_cbor::from_slice(body)?),
            CMD_REQ_METADATA => Self::ReqMetadata(serde_cbor::from_slice(body)?),
            CMD_RESP_METADATA => Self::RespMetadata(serde_cbor::from_slice(body)?),
            CMD_REQ_CHUNK => Self::ReqChunk(serde_cbor::from_slice(body)?),
            CMD_RESP_CHUNK => Self::RespChunk(serde_cbor::from_slice(body)?),
            CMD_SEARCH_REQUEST => Self::SearchRequest(serde_cbor::from_slice(body)?),
            CMD_SEARCH_RESPONSE => Self::SearchResponse(serde_cbor::from_slice(body)?),
            CMD_PIN_ANNOUNCE => Self::PinAnnounce(serde_cbor::from_slice(body)?),
            CMD_PIN_CANCEL => Self::PinCancel(serde_cbor::from_slice(body)?),
            CMD_GET_MANIFEST => Self::GetManifest(serde_cbor::from_slice(body)?),
            CMD_MANIFEST => Self::Manifest(serde_cbor::from_slice(body)?),
            CMD_GET_CONTENT => Self::GetContent(serde_cbor::from_slice(body)?),
            CMD_CONTENT => Self::Content(serde_cbor::from_slice(body)?),
            CMD_OK => Self::Ok,
            CMD_ERR => Self::Err(serde_cbor::from_slice(body)?),
            other => {
                anyhow::bail!(NodeError::protocol(format!(
                    "unexpected command byte 0x{other:02x}"
                )))
            }
        };
        Ok(message)
    }
}

/// Write one command frame: command byte, 4-byte big-endian length, body.
pub async fn write_frame<S>(io: &mut S, command: u8, body: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_BYTES {
        anyhow::bail!(NodeError::protocol("frame exceeds max size"));
    }
    let len = u32::try_from(body.len()).context("frame too large for u32 length prefix")?;
    io.write_u8(command).await?;
    io.write_u32(len).await?; // big-endian by tokio default
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

/// Read one command frame. Rejects frames larger than [`MAX_FRAME_BYTES`]
/// before allocating.
pub async fn read_frame<S>(io: &mut S) -> anyhow::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let command = io.read_u8().await?;
    let len = io.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!(NodeError::protocol("frame exceeds max size"));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok((command, body))
}

pub async fn write_message<S>(io: &mut S, message: &Message) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_frame(io, message.command(), &message.encode_body()?).await
}

pub async fn read_message<S>(io: &mut S) -> anyhow::Result<Message>
where
    S: AsyncRead + Unpin,
{
    let (command, body) = read_frame(io).await?;
    Message::decode(command, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};

    fn peer(id: &str) -> PeerIdentity {
        PeerIdentity {
            peer_id: id.to_owned(),
            display_name: id.to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 9000,
            public_key: [3u8; 32],
        }
    }

    #[tokio::test]
    async fn message_framing_roundtrip() {
        let request = Message::ReqChunk(ChunkRequest {
            path: "/srv/share/notes.txt".to_owned(),
            chunk_index: 7,
            chunk_size: 65536,
        });

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &request).await.expect("write");
        let decoded = read_message(&mut b).await.expect("read");
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn search_messages_roundtrip() {
        let request = Message::SearchRequest(SearchRequest {
            request_id: "11111111-2222-3333-4444-555555555555".to_owned(),
            origin: peer("origin"),
            query: "alpha".to_owned(),
            ttl: 2,
        });
        let (mut a, mut b) = tokio::io::duplex(8192);
        write_message(&mut a, &request).await.expect("write");
        assert_eq!(read_message(&mut b).await.expect("read"), request);
    }

    #[tokio::test]
    async fn ok_frame_has_empty_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_message(&mut a, &Message::Ok).await.expect("write");
        let (command, body) = read_frame(&mut b).await.expect("read");
        assert_eq!(command, CMD_OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, 0x5A, b"").await.expect("write");
        let (command, body) = read_frame(&mut b).await.expect("read frame");
        let err = Message::decode(command, &body).expect_err("must reject");
        assert_eq!(error_kind(&err), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_u8(&mut a, CMD_REQ_CHUNK)
            .await
            .expect("cmd");
        tokio::io::AsyncWriteExt::write_u32(&mut a, (MAX_FRAME_BYTES + 1) as u32)
            .await
            .expect("len");
        let err = read_frame(&mut b).await.expect_err("must reject");
        assert_eq!(error_kind(&err), ErrorKind::Protocol);
    }

    #[test]
    fn wire_error_maps_to_error_kinds() {
        assert_eq!(
            WireError::not_found("gone").to_node_error().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            WireError::forbidden("no preview").to_node_error().kind,
            ErrorKind::Permission
        );
        assert_eq!(
            WireError::io("reset").to_node_error().kind,
            ErrorKind::Transport
        );
    }
}
