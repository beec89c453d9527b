// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

/// One upload in flight or at rest. Created lazily by the first chunk;
/// `stored_size` grows monotonically by the length of each accepted
/// chunk.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    pub stored_size: u64,
    pub received_chunks: HashSet<u32>,
    pub created_at_unix: u64,
    pub expires_at_unix: u64,
    pub file_path: PathBuf,
}

impl UploadSession {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix > self.expires_at_unix
    }
}

/// Disk-backed upload store. Appends for one upload are serialized under
/// the store lock, which is the single-writer guarantee the chunked
/// append format needs.
#[derive(Debug)]
pub struct UploadStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
    storage_dir: PathBuf,
    default_expiry: Duration,
}

impl UploadStore {
    pub fn new(storage_dir: &Path, default_expiry: Duration) -> anyhow::Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .with_context(|| format!("create storage dir {}", storage_dir.display()))?;
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            storage_dir: storage_dir.to_path_buf(),
            default_expiry,
        })
    }

    /// Append one chunk, creating the session on first contact. Returns a
    /// snapshot of the session after the append.
    pub fn append_chunk(
        &self,
        upload_id: &str,
        file_name: &str,
        chunk_index: u32,
        bytes: &[u8],
        now_unix: u64,
    ) -> anyhow::Result<UploadSession> {
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            anyhow::bail!("invalid upload id");
        }
        let safe_name = sanitize_file_name(file_name);

        let mut sessions = self.sessions.lock().expect("upload store poisoned");
        let session = sessions.entry(upload_id.to_owned()).or_insert_with(|| {
            info!(upload_id, file_name = %safe_name, "new upload session");
            UploadSession {
                upload_id: upload_id.to_owned(),
                file_name: safe_name.clone(),
                stored_size: 0,
                received_chunks: HashSet::new(),
                created_at_unix: now_unix,
                expires_at_unix: now_unix + self.default_expiry.as_secs(),
                file_path: self
                    .storage_dir
                    .join(format!("{upload_id}_{safe_name}")),
            }
        });
        if session.is_expired(now_unix) {
            anyhow::bail!("upload session expired");
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&session.file_path)
            .with_context(|| format!("open {}", session.file_path.display()))?;
        file.write_all(bytes)?;

        session.stored_size += bytes.len() as u64;
        session.received_chunks.insert(chunk_index);
        debug!(
            upload_id,
            chunk_index,
            stored = session.stored_size,
            "chunk stored"
        );
        Ok(session.clone())
    }

    pub fn get(&self, upload_id: &str) -> Option<UploadSession> {
        self.sessions
            .lock()
            .expect("upload store poisoned")
            .get(upload_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("upload store poisoned").len()
    }

    /// Remove expired sessions; each file is deleted from disk before the
    /// session is dropped from memory. Returns the removed upload ids.
    pub fn sweep(&self, now_unix: u64) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("upload store poisoned");
        let mut removed = Vec::new();
        sessions.retain(|upload_id, session| {
            if !session.is_expired(now_unix) {
                return true;
            }
            if let Err(err) = std::fs::remove_file(&session.file_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(upload_id, error = %err, "could not delete expired upload file");
                }
            }
            removed.push(upload_id.clone());
            false
        });
        if !removed.is_empty() {
            info!(count = removed.len(), "expired uploads removed");
        }
        removed
    }
}

/// Strip path components; uploads name files, not directories.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim();
    if base.is_empty() {
        "unnamed".to_owned()
    } else {
        base.to_owned()
    }
}
