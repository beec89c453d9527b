// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! JSON bodies and headers of the relay HTTP API, shared by the client
//! and the relay server.

use serde::{Deserialize, Serialize};

use crate::identity::{FileHash, SharedFileSummary};

pub const HEADER_UPLOAD_ID: &str = "X-Upload-Id";
pub const HEADER_CHUNK_INDEX: &str = "X-Chunk-Index";
pub const HEADER_FILE_NAME: &str = "X-File-Name";
pub const HEADER_SENDER_ID: &str = "X-Sender-Id";
pub const HEADER_API_KEY: &str = "X-API-Key";

/// A file hosted on the relay, as handed to recipients via PIN lookup or
/// the relay search index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayFileRef {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Hex SHA-256 of the original file; may be absent for legacy senders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub download_url: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_unix: Option<u64>,
    #[serde(default)]
    pub download_count: u32,
    #[serde(default)]
    pub max_downloads: u32,
}

impl RelayFileRef {
    pub fn parsed_hash(&self) -> Option<FileHash> {
        self.file_hash
            .as_deref()
            .and_then(|hex| FileHash::from_hex(hex).ok())
    }

    /// View as a search-result summary. A ref without a usable hash gets
    /// the zero digest; such entries only support download, not preview.
    pub fn to_summary(&self) -> SharedFileSummary {
        SharedFileSummary {
            logical_name: self.file_name.clone(),
            size: self.file_size,
            file_hash: self.parsed_hash().unwrap_or(FileHash([0u8; 32])),
            owner_peer_id: self.sender_id.clone(),
            relay_ref: Some(self.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub upload_id: String,
    pub chunk_index: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub file_name: String,
    pub uploaded_size: u64,
    pub chunks: u32,
    pub expired: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub active_peers: usize,
    pub active_uploads: usize,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPeerRequest {
    pub peer_id: String,
    pub display_name: String,
    /// `"auto"` asks the relay to derive the address from the socket.
    pub public_ip: String,
    pub port: u16,
    /// Hex Ed25519 verifying key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPeerResponse {
    pub success: bool,
    pub message: String,
    pub public_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayPeer {
    pub peer_id: String,
    pub display_name: String,
    pub ip_address: String,
    pub port: u16,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerListResponse {
    pub peers: Vec<RelayPeer>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSearchResponse {
    pub files: Vec<RelayFileRef>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinCreateRequest {
    pub pin: String,
    #[serde(flatten)]
    pub file: RelayFileRef,
    pub expiry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinFindResponse {
    pub found: bool,
    #[serde(flatten, default)]
    pub file: Option<RelayFileRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}
