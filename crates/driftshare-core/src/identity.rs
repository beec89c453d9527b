// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::relay::protocol::RelayFileRef;

/// SHA-256 digest identifying a file's contents. The canonical identifier
/// for preview lookups and remote search results; logical names may collide,
/// hashes may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash(pub [u8; 32]);

impl FileHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Streaming digest so multi-gigabyte shares never load whole into memory.
    pub fn of_file(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("open {} for hashing", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Ok(Self(out))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(input: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(input).context("file hash must be hex")?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("file hash must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A peer as announced on the discovery channel and pinned thereafter.
///
/// `(peer_id, public_key)` is fixed for the life of the remote process; a
/// peer claiming a known id under a different key is rejected at the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub public_key: [u8; 32],
}

impl PeerIdentity {
    /// Sentinel identity used when a PIN or search result resolved through
    /// the relay and no direct peer address exists.
    pub fn relay_synthetic(sender_id: &str, sender_name: Option<&str>) -> Self {
        Self {
            peer_id: sender_id.to_owned(),
            display_name: sender_name.unwrap_or("relay peer").to_owned(),
            host: RELAY_HOST_SENTINEL.to_owned(),
            port: 0,
            public_key: [0u8; 32],
        }
    }

    pub fn is_relay_only(&self) -> bool {
        self.host.is_empty() || self.host == RELAY_HOST_SENTINEL
    }
}

/// Host value marking a peer reachable only through the relay.
pub const RELAY_HOST_SENTINEL: &str = "relay";

/// A file this node offers, keyed into the share index by directory.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub local_path: PathBuf,
    pub logical_name: String,
    pub size: u64,
    pub file_hash: FileHash,
    pub owner_peer_id: String,
}

impl SharedFile {
    pub fn from_path(path: &Path, owner_peer_id: &str) -> anyhow::Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("stat shared file {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let logical_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned());
        Ok(Self {
            local_path: path.to_path_buf(),
            logical_name,
            size: metadata.len(),
            file_hash: FileHash::of_file(path)?,
            owner_peer_id: owner_peer_id.to_owned(),
        })
    }

    pub fn summary(&self) -> SharedFileSummary {
        SharedFileSummary {
            logical_name: self.logical_name.clone(),
            size: self.size,
            file_hash: self.file_hash,
            owner_peer_id: self.owner_peer_id.clone(),
            relay_ref: None,
        }
    }
}

/// The wire form of a shared file: what search responses carry and what a
/// download is requested against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedFileSummary {
    pub logical_name: String,
    pub size: u64,
    pub file_hash: FileHash,
    pub owner_peer_id: String,
    /// Present when the owner mirrored the file onto the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_ref: Option<RelayFileRef>,
}
