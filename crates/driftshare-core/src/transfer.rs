// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::codec::{chunk_len, total_chunks};
use crate::error::NodeError;
use crate::identity::{FileHash, PeerIdentity};

/// Fixed-size bitset over chunk indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitset {
    words: Vec<u64>,
    len: u32,
}

impl ChunkBitset {
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0u64; (len as usize).div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: u32) {
        assert!(index < self.len, "chunk index out of range");
        self.words[(index / 64) as usize] |= 1u64 << (index % 64);
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    pub fn cardinality(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.cardinality() == self.len
    }

    pub fn first_clear(&self) -> Option<u32> {
        (0..self.len).find(|&index| !self.get(index))
    }

    pub fn clear_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&index| !self.get(index))
    }

    pub fn set_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&index| self.get(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Book-keeping for one download. Exactly one task mutates the chunk set;
/// observers read snapshots through the engine.
#[derive(Debug)]
pub struct TransferState {
    pub transfer_id: String,
    pub peer: PeerIdentity,
    pub file_name: String,
    /// The reference sent in REQ_METADATA / REQ_CHUNK (hash hex, logical
    /// name, or owner-side path).
    pub remote_ref: String,
    pub file_size: u64,
    pub file_hash: Option<FileHash>,
    pub chunk_size: u32,
    pub total_chunks: u32,
    received: ChunkBitset,
    pub bytes_transferred: u64,
    status: TransferStatus,
    pub error: Option<String>,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    accumulated_pause: Duration,
    pub save_dir: PathBuf,
}

impl TransferState {
    pub fn new(
        peer: PeerIdentity,
        file_name: String,
        remote_ref: String,
        file_size: u64,
        file_hash: Option<FileHash>,
        chunk_size: u32,
        save_dir: PathBuf,
    ) -> Self {
        let chunks = total_chunks(file_size, chunk_size as usize);
        Self {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            peer,
            file_name,
            remote_ref,
            file_size,
            file_hash,
            chunk_size,
            total_chunks: chunks,
            received: ChunkBitset::new(chunks),
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            error: None,
            started_at: None,
            paused_at: None,
            accumulated_pause: Duration::ZERO,
            save_dir,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn received(&self) -> &ChunkBitset {
        &self.received
    }

    pub fn start(&mut self) {
        if self.status == TransferStatus::Pending {
            self.status = TransferStatus::InProgress;
            self.started_at = Some(Instant::now());
        }
    }

    /// Honored only from `InProgress`; the in-flight chunk either commits
    /// whole or not at all.
    pub fn pause(&mut self) {
        if self.status == TransferStatus::InProgress {
            self.status = TransferStatus::Paused;
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if self.status == TransferStatus::Paused {
            self.status = TransferStatus::InProgress;
            if let Some(paused_at) = self.paused_at.take() {
                self.accumulated_pause += paused_at.elapsed();
            }
        }
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Cancelled;
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Failed;
            self.error = Some(reason.into());
        }
    }

    pub fn complete(&mut self) -> anyhow::Result<()> {
        if !self.received.is_full() {
            anyhow::bail!(NodeError::protocol(format!(
                "transfer incomplete: {}/{} chunks",
                self.received.cardinality(),
                self.total_chunks
            )));
        }
        self.status = TransferStatus::Completed;
        Ok(())
    }

    /// Commit a fully received chunk. Partial chunks are never committed.
    pub fn mark_chunk(&mut self, index: u32) -> anyhow::Result<()> {
        if index >= self.total_chunks {
            anyhow::bail!(NodeError::protocol(format!(
                "chunk index {index} out of range ({} total)",
                self.total_chunks
            )));
        }
        if self.received.get(index) {
            return Ok(()); // duplicate delivery is harmless
        }
        self.received.set(index);
        self.bytes_transferred += chunk_len(index, self.chunk_size as usize, self.file_size) as u64;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_full()
    }

    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.bytes_transferred as f64 / self.file_size as f64
    }

    /// Wall time actually spent transferring, excluding pauses.
    pub fn active_time(&self) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let paused_now = self
            .paused_at
            .map(|paused_at| paused_at.elapsed())
            .unwrap_or(Duration::ZERO);
        started_at
            .elapsed()
            .saturating_sub(self.accumulated_pause)
            .saturating_sub(paused_now)
    }

    /// Bytes per second over active time.
    pub fn speed(&self) -> f64 {
        let secs = self.active_time().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes_transferred as f64 / secs
    }

    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed();
        if speed <= f64::EPSILON {
            return None;
        }
        let remaining = self.file_size.saturating_sub(self.bytes_transferred) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    pub fn part_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}.part", self.file_name))
    }

    pub fn final_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    pub fn state_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}.part.state", self.file_name))
    }

    pub fn persisted(&self) -> PersistedTransfer {
        PersistedTransfer {
            transfer_id: self.transfer_id.clone(),
            peer_id: self.peer.peer_id.clone(),
            file_name: self.file_name.clone(),
            remote_ref: self.remote_ref.clone(),
            file_size: self.file_size,
            file_hash: self.file_hash,
            chunk_size: self.chunk_size,
            completed_chunks: self.received.set_indices().collect(),
        }
    }

    /// Rebuild an interrupted transfer from its sidecar. Chunk state that
    /// does not align with the current chunk size is discarded rather than
    /// trusted.
    pub fn from_persisted(
        persisted: PersistedTransfer,
        peer: PeerIdentity,
        expected_chunk_size: u32,
        save_dir: PathBuf,
    ) -> Self {
        let mut state = Self::new(
            peer,
            persisted.file_name,
            persisted.remote_ref,
            persisted.file_size,
            persisted.file_hash,
            expected_chunk_size,
            save_dir,
        );
        state.transfer_id = persisted.transfer_id;
        if persisted.chunk_size == expected_chunk_size {
            for index in persisted.completed_chunks {
                let _ = state.mark_chunk(index);
            }
        }
        state
    }
}

/// Resume sidecar stored next to the `.part` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTransfer {
    pub transfer_id: String,
    pub peer_id: String,
    pub file_name: String,
    pub remote_ref: String,
    pub file_size: u64,
    pub file_hash: Option<FileHash>,
    pub chunk_size: u32,
    pub completed_chunks: Vec<u32>,
}

impl PersistedTransfer {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("persist transfer state to {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read transfer state from {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

/// The pre-sized destination of an in-progress transfer. Held by exactly
/// one transfer task; decrypted chunk bytes land at `index * chunk_size`
/// via positioned writes, never appends.
#[derive(Debug)]
pub struct PartFile {
    file: File,
    path: PathBuf,
}

impl PartFile {
    /// Create (or truncate) the `.part` file pre-allocated to the final
    /// size.
    pub fn create(path: &Path, file_size: u64) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create download dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create part file {}", path.display()))?;
        file.set_len(file_size)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing `.part` file for resume. Fails if the on-disk size
    /// does not match the expected final size.
    pub fn open_existing(path: &Path, file_size: u64) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open part file {}", path.display()))?;
        let actual = file.metadata()?.len();
        if actual != file_size {
            anyhow::bail!(NodeError::integrity(format!(
                "part file {} is {actual} bytes, expected {file_size}",
                path.display()
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn read_span(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Flush and atomically rename onto the final destination.
    pub fn finalize(self, destination: &Path) -> anyhow::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        std::fs::rename(&self.path, destination).with_context(|| {
            format!(
                "rename {} to {}",
                self.path.display(),
                destination.display()
            )
        })
    }

    /// Delete the partial file (cancel path).
    pub fn discard(self) {
        drop(self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerIdentity {
        PeerIdentity {
            peer_id: "peer-a".to_owned(),
            display_name: "Peer A".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 9000,
            public_key: [1u8; 32],
        }
    }

    fn state(file_size: u64, chunk_size: u32) -> TransferState {
        TransferState::new(
            peer(),
            "notes.txt".to_owned(),
            "notes.txt".to_owned(),
            file_size,
            None,
            chunk_size,
            PathBuf::from("/tmp/downloads"),
        )
    }

    #[test]
    fn bitset_set_get_cardinality() {
        let mut bits = ChunkBitset::new(130);
        assert_eq!(bits.first_clear(), Some(0));
        bits.set(0);
        bits.set(64);
        bits.set(129);
        assert!(bits.get(64));
        assert!(!bits.get(1));
        assert_eq!(bits.cardinality(), 3);
        assert_eq!(bits.first_clear(), Some(1));
        assert!(!bits.is_full());
    }

    #[test]
    fn byte_accounting_matches_chunk_spans() {
        // 131072 bytes at 65536 per chunk: two full chunks
        let mut state1 = state(131_072, 65_536);
        assert_eq!(state1.total_chunks, 2);
        state1.mark_chunk(0).expect("chunk 0");
        assert_eq!(state1.bytes_transferred, 65_536);
        state1.mark_chunk(1).expect("chunk 1");
        assert_eq!(state1.bytes_transferred, 131_072);
        assert!(state1.is_complete());

        // short trailing chunk
        let mut state2 = state(65_536 + 5, 65_536);
        state2.mark_chunk(0).expect("chunk 0");
        state2.mark_chunk(1).expect("chunk 1");
        assert_eq!(state2.bytes_transferred, 65_536 + 5);
    }

    #[test]
    fn duplicate_chunk_commits_are_idempotent() {
        let mut state = state(100, 64);
        state.mark_chunk(0).expect("first");
        state.mark_chunk(0).expect("duplicate");
        assert_eq!(state.bytes_transferred, 64);
    }

    #[test]
    fn zero_byte_file_completes_with_no_chunks() {
        let mut state = state(0, 65_536);
        assert_eq!(state.total_chunks, 0);
        assert!(state.is_complete());
        state.start();
        state.complete().expect("complete immediately");
        assert_eq!(state.status(), TransferStatus::Completed);
    }

    #[test]
    fn fsm_pause_only_from_in_progress() {
        let mut state = state(100, 64);
        state.pause();
        assert_eq!(state.status(), TransferStatus::Pending);
        state.start();
        state.pause();
        assert_eq!(state.status(), TransferStatus::Paused);
        state.resume();
        assert_eq!(state.status(), TransferStatus::InProgress);
    }

    #[test]
    fn cancel_from_any_non_terminal_state() {
        let mut pending = state(100, 64);
        pending.cancel();
        assert_eq!(pending.status(), TransferStatus::Cancelled);

        let mut paused = state(100, 64);
        paused.start();
        paused.pause();
        paused.cancel();
        assert_eq!(paused.status(), TransferStatus::Cancelled);

        // terminal states stay put
        paused.fail("late failure");
        assert_eq!(paused.status(), TransferStatus::Cancelled);
    }

    #[test]
    fn complete_requires_full_bitset() {
        let mut state = state(130, 64);
        state.start();
        state.mark_chunk(0).expect("chunk");
        state.complete().expect_err("incomplete transfer");
        state.mark_chunk(1).expect("chunk");
        state.mark_chunk(2).expect("chunk");
        state.complete().expect("complete");
    }

    #[test]
    fn persisted_roundtrip_restores_chunk_state() {
        let mut original = state(300, 64);
        original.mark_chunk(0).expect("chunk");
        original.mark_chunk(3).expect("chunk");

        let restored = TransferState::from_persisted(
            original.persisted(),
            peer(),
            64,
            PathBuf::from("/tmp/downloads"),
        );
        assert_eq!(restored.transfer_id, original.transfer_id);
        assert_eq!(restored.bytes_transferred, original.bytes_transferred);
        assert_eq!(restored.received().first_clear(), Some(1));
    }

    #[test]
    fn persisted_state_with_wrong_chunk_size_is_discarded() {
        let mut original = state(300, 64);
        original.mark_chunk(0).expect("chunk");
        let restored = TransferState::from_persisted(
            original.persisted(),
            peer(),
            128,
            PathBuf::from("/tmp/downloads"),
        );
        assert_eq!(restored.bytes_transferred, 0);
        assert_eq!(restored.received().cardinality(), 0);
    }

    #[test]
    fn part_file_positioned_writes_and_finalize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let part_path = dir.path().join("out.bin.part");
        let final_path = dir.path().join("out.bin");

        let mut part = PartFile::create(&part_path, 10).expect("create");
        // out-of-order positioned writes
        part.write_chunk(6, b"wxyz").expect("tail");
        part.write_chunk(0, b"abcdef").expect("head");
        assert_eq!(part.read_span(4, 4).expect("read"), b"efwx");
        part.finalize(&final_path).expect("finalize");

        assert!(!part_path.exists());
        assert_eq!(std::fs::read(&final_path).expect("read final"), b"abcdefwxyz");
    }

    #[test]
    fn part_file_open_existing_checks_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let part_path = dir.path().join("out.bin.part");
        PartFile::create(&part_path, 10).expect("create");

        PartFile::open_existing(&part_path, 10).expect("matching size");
        PartFile::open_existing(&part_path, 11).expect_err("size mismatch");
    }

    #[test]
    fn sidecar_save_load_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.txt.part.state");
        let mut state = state(300, 64);
        state.mark_chunk(1).expect("chunk");

        state.persisted().save(&path).expect("save");
        let loaded = PersistedTransfer::load(&path).expect("load");
        assert_eq!(loaded.completed_chunks, vec![1]);

        PersistedTransfer::remove(&path);
        assert!(!path.exists());
    }
}
