// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::security::SecurityContext;

/// Chunk size on the direct path. Small enough that pause/resume reacts
/// within a chunk boundary quickly.
pub const DIRECT_CHUNK_SIZE: usize = 64 * 1024;
/// Chunk size for relay uploads.
pub const RELAY_CHUNK_SIZE: usize = 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// Extensions that are already entropy-dense; compressing them wastes CPU.
const INCOMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "jar", // containers
    "jpg", "jpeg", "png", "gif", "webp", "heic", // images
    "mp3", "aac", "ogg", "opus", "flac", "m4a", // audio
    "mp4", "mkv", "avi", "mov", "webm", // video
    "pdf",
];

/// One encoded chunk as carried on the wire: compress-then-encrypt, with
/// the sealed payload embedding its own nonce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub chunk_index: u32,
    pub original_len: u32,
    pub compressed: bool,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ChunkRecord {
    pub fn encrypted_len(&self) -> usize {
        self.payload.len()
    }
}

/// Heuristic on the logical filename: compress unless the extension marks
/// an already-compressed container, image, audio or video format.
pub fn is_compressible(logical_name: &str) -> bool {
    let Some(extension) = logical_name.rsplit('.').next() else {
        return true;
    };
    if extension.len() == logical_name.len() {
        // no dot at all
        return true;
    }
    let extension = extension.to_ascii_lowercase();
    !INCOMPRESSIBLE_EXTENSIONS.contains(&extension.as_str())
}

pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    if file_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64) as u32
}

/// Length of chunk `index` given the fixed chunk size; the final chunk may
/// be short unless the size is an exact multiple.
pub fn chunk_len(index: u32, chunk_size: usize, file_size: u64) -> usize {
    let start = index as u64 * chunk_size as u64;
    let remaining = file_size.saturating_sub(start);
    remaining.min(chunk_size as u64) as usize
}

pub fn encode_chunk(
    chunk_index: u32,
    plaintext: &[u8],
    compress_hint: bool,
    key: &[u8; 32],
) -> anyhow::Result<ChunkRecord> {
    let original_len = u32::try_from(plaintext.len())
        .map_err(|_| NodeError::protocol("chunk exceeds u32 length"))?;

    let (body, compressed) = if compress_hint && !plaintext.is_empty() {
        let deflated = zstd::bulk::compress(plaintext, ZSTD_LEVEL)
            .map_err(|err| NodeError::integrity(format!("compression failed: {err}")))?;
        // keep the deflated form only when it actually helps
        if deflated.len() < plaintext.len() {
            (deflated, true)
        } else {
            (plaintext.to_vec(), false)
        }
    } else {
        (plaintext.to_vec(), false)
    };

    let payload = SecurityContext::seal(key, &body)?;
    Ok(ChunkRecord {
        chunk_index,
        original_len,
        compressed,
        payload,
    })
}

/// Decodes to exactly `original_len` bytes or fails with an integrity
/// error; a truncated or tampered record never yields short output.
pub fn decode_chunk(record: &ChunkRecord, key: &[u8; 32]) -> anyhow::Result<Vec<u8>> {
    let body = SecurityContext::open(key, &record.payload)?;
    let plaintext = if record.compressed {
        zstd::bulk::decompress(&body, record.original_len as usize)
            .map_err(|err| NodeError::integrity(format!("decompression failed: {err}")))?
    } else {
        body
    };
    if plaintext.len() != record.original_len as usize {
        anyhow::bail!(NodeError::integrity(format!(
            "chunk {} decoded to {} bytes, expected {}",
            record.chunk_index,
            plaintext.len(),
            record.original_len
        )));
    }
    Ok(plaintext)
}
