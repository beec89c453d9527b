// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NodeError;
use crate::identity::{FileHash, SharedFile};
use crate::search::ShareIndex;
use crate::security::SecurityContext;
use crate::transport::now_unix_secs;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PreviewKind {
    Thumbnail,
    TextSnippet,
    ArchiveListing,
    MetadataOnly,
    PdfPages,
    AudioSample,
    VideoPreview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Signed summary of a file's available preview representations. Nothing
/// beyond identity and signature may be trusted until [`verify`] passes.
///
/// [`verify`]: PreviewManifest::verify
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewManifest {
    pub file_hash: FileHash,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub last_modified_unix: u64,
    pub available: BTreeSet<PreviewKind>,
    pub preview_hashes: BTreeMap<PreviewKind, FileHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<serde_bytes::ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_listing: Option<Vec<ArchiveEntry>>,
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
    pub allow_preview: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_peers_only: Option<BTreeSet<String>>,
    pub owner_peer_id: String,
    pub timestamp_unix: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Signature payload: positional CBOR of the identity fields, per the
/// manifest contract.
#[derive(Serialize)]
struct ManifestSigningTuple<'a>(FileHash, &'a str, u64, &'a str, u64, &'a str);

impl PreviewManifest {
    pub fn signable_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(&ManifestSigningTuple(
            self.file_hash,
            &self.file_name,
            self.file_size,
            &self.mime_type,
            self.timestamp_unix,
            &self.owner_peer_id,
        ))?)
    }

    pub fn sign(&mut self, security: &SecurityContext) -> anyhow::Result<()> {
        self.signature = security.sign(&self.signable_bytes()?).to_vec();
        Ok(())
    }

    /// Verify under the owner's pinned public key. Callers must discard
    /// the manifest on failure and fetch no content on its basis.
    pub fn verify(&self, owner_public_key: &[u8; 32]) -> anyhow::Result<()> {
        SecurityContext::verify(&self.signable_bytes()?, &self.signature, owner_public_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewContent {
    pub file_hash: FileHash,
    pub kind: PreviewKind,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub data_hash: FileHash,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub timestamp_unix: u64,
}

/// Accept content only when its digest matches the entry the verified
/// manifest recorded for that kind.
pub fn verify_content(manifest: &PreviewManifest, content: &PreviewContent) -> anyhow::Result<()> {
    let expected = manifest.preview_hashes.get(&content.kind).ok_or_else(|| {
        NodeError::permission(format!("manifest lists no {:?} preview", content.kind))
    })?;
    if content.data_hash != *expected {
        anyhow::bail!(NodeError::integrity("preview content hash mismatch"));
    }
    let actual = FileHash::of_bytes(&content.data);
    if actual != *expected {
        anyhow::bail!(NodeError::integrity("preview content bytes do not match digest"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub max_file_size: u64,
    pub thumbnail_size: u32,
    pub text_max_lines: usize,
    pub text_max_chars: usize,
    pub allow_preview: bool,
    pub trusted_peers_only: Option<BTreeSet<String>>,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            thumbnail_size: 200,
            text_max_lines: 10,
            text_max_chars: 500,
            allow_preview: true,
            trusted_peers_only: None,
        }
    }
}

/// Crude extension table; enough to pick a preview strategy.
pub fn mime_type_for(logical_name: &str) -> &'static str {
    let extension = logical_name
        .rsplit('.')
        .next()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "md" | "log" | "csv" | "json" | "xml" | "toml" | "yaml" | "yml" | "rs" | "py"
        | "java" | "c" | "h" | "js" | "ts" | "html" | "css" | "sh" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "zip" | "jar" => "application/zip",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

#[derive(Debug)]
pub struct GeneratedPreview {
    pub manifest: PreviewManifest,
    pub contents: Vec<PreviewContent>,
}

/// Build and sign the manifest for a newly shared file, synchronously.
pub fn generate_preview(
    shared: &SharedFile,
    settings: &PreviewSettings,
    security: &SecurityContext,
) -> anyhow::Result<GeneratedPreview> {
    let now = now_unix_secs()?;
    let mime_type = mime_type_for(&shared.logical_name);
    let last_modified_unix = std::fs::metadata(&shared.local_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(now);

    let mut manifest = PreviewManifest {
        file_hash: shared.file_hash,
        file_name: shared.logical_name.clone(),
        file_size: shared.size,
        mime_type: mime_type.to_owned(),
        last_modified_unix,
        available: BTreeSet::from([PreviewKind::MetadataOnly]),
        preview_hashes: BTreeMap::new(),
        snippet: None,
        archive_listing: None,
        extra_metadata: BTreeMap::new(),
        allow_preview: settings.allow_preview,
        trusted_peers_only: settings.trusted_peers_only.clone(),
        owner_peer_id: shared.owner_peer_id.clone(),
        timestamp_unix: now,
        signature: vec![],
    };
    let mut contents = Vec::new();

    // files past the size cap only ever get metadata
    if shared.size > 0 && shared.size <= settings.max_file_size {
        if mime_type.starts_with("image/") {
            match generate_thumbnail(shared, settings, now) {
                Ok(content) => {
                    manifest.available.insert(PreviewKind::Thumbnail);
                    manifest
                        .preview_hashes
                        .insert(PreviewKind::Thumbnail, content.data_hash);
                    contents.push(content);
                }
                Err(err) => debug!(file = %shared.logical_name, error = %err,
                    "thumbnail generation failed, serving metadata only"),
            }
        } else if mime_type.starts_with("text/") {
            let content = generate_text_snippet(shared, settings, now)?;
            manifest.snippet = Some(serde_bytes::ByteBuf::from(content.data.clone()));
            manifest.available.insert(PreviewKind::TextSnippet);
            manifest
                .preview_hashes
                .insert(PreviewKind::TextSnippet, content.data_hash);
            contents.push(content);
        } else if mime_type == "application/zip" {
            match generate_archive_listing(shared, now) {
                Ok((content, entries, total_uncompressed)) => {
                    manifest.archive_listing = Some(entries);
                    manifest
                        .extra_metadata
                        .insert("total_uncompressed_size".to_owned(), total_uncompressed.to_string());
                    manifest.available.insert(PreviewKind::ArchiveListing);
                    manifest
                        .preview_hashes
                        .insert(PreviewKind::ArchiveListing, content.data_hash);
                    contents.push(content);
                }
                Err(err) => debug!(file = %shared.logical_name, error = %err,
                    "archive listing failed, serving metadata only"),
            }
        }
    }

    manifest.sign(security)?;
    Ok(GeneratedPreview { manifest, contents })
}

fn generate_thumbnail(
    shared: &SharedFile,
    settings: &PreviewSettings,
    now: u64,
) -> anyhow::Result<PreviewContent> {
    let bytes = std::fs::read(&shared.local_path)
        .with_context(|| format!("read {} for thumbnail", shared.local_path.display()))?;
    let decoded = image::load_from_memory(&bytes).context("decode image")?;
    let thumb = decoded.thumbnail(settings.thumbnail_size, settings.thumbnail_size);
    let thumb = DynamicImage::ImageRgb8(thumb.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("encode thumbnail as jpeg")?;
    let data = out.into_inner();
    let data_hash = FileHash::of_bytes(&data);
    Ok(PreviewContent {
        file_hash: shared.file_hash,
        kind: PreviewKind::Thumbnail,
        dims: Some((thumb.width(), thumb.height())),
        data,
        data_hash,
        format: "jpeg".to_owned(),
        encoding: None,
        timestamp_unix: now,
    })
}

/// First `text_max_lines` lines or `text_max_chars` characters, whichever
/// cuts shorter.
fn generate_text_snippet(
    shared: &SharedFile,
    settings: &PreviewSettings,
    now: u64,
) -> anyhow::Result<PreviewContent> {
    let bytes = std::fs::read(&shared.local_path)
        .with_context(|| format!("read {} for snippet", shared.local_path.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let mut snippet = String::new();
    for (index, line) in text.lines().enumerate() {
        if index >= settings.text_max_lines {
            break;
        }
        if index > 0 {
            snippet.push('\n');
        }
        snippet.push_str(line);
    }
    if snippet.chars().count() > settings.text_max_chars {
        snippet = snippet.chars().take(settings.text_max_chars).collect();
    }

    let data = snippet.into_bytes();
    let data_hash = FileHash::of_bytes(&data);
    Ok(PreviewContent {
        file_hash: shared.file_hash,
        kind: PreviewKind::TextSnippet,
        data,
        data_hash,
        format: "text".to_owned(),
        dims: None,
        encoding: Some("utf-8".to_owned()),
        timestamp_unix: now,
    })
}

fn generate_archive_listing(
    shared: &SharedFile,
    now: u64,
) -> anyhow::Result<(PreviewContent, Vec<ArchiveEntry>, u64)> {
    let file = std::fs::File::open(&shared.local_path)
        .with_context(|| format!("open {} for listing", shared.local_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("read zip archive")?;

    let mut entries = Vec::with_capacity(archive.len());
    let mut total_uncompressed = 0u64;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).context("read zip entry")?;
        total_uncompressed += entry.size();
        entries.push(ArchiveEntry {
            name: entry.name().to_owned(),
            size: entry.size(),
            is_dir: entry.is_dir(),
        });
    }

    let data = serde_cbor::to_vec(&entries)?;
    let data_hash = FileHash::of_bytes(&data);
    Ok((
        PreviewContent {
            file_hash: shared.file_hash,
            kind: PreviewKind::ArchiveListing,
            data,
            data_hash,
            format: "cbor".to_owned(),
            dims: None,
            encoding: None,
            timestamp_unix: now,
        },
        entries,
        total_uncompressed,
    ))
}

/// Generates, caches, and serves manifests and preview contents for this
/// node's shared files.
pub struct PreviewService {
    index: Arc<ShareIndex>,
    security: Arc<SecurityContext>,
    settings: PreviewSettings,
    manifests: Mutex<HashMap<FileHash, PreviewManifest>>,
    contents: Mutex<HashMap<(FileHash, PreviewKind), PreviewContent>>,
}

impl PreviewService {
    pub fn new(
        index: Arc<ShareIndex>,
        security: Arc<SecurityContext>,
        settings: PreviewSettings,
    ) -> Self {
        Self {
            index,
            security,
            settings,
            manifests: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
        }
    }

    /// Called when a file is shared. Generation is synchronous; the signed
    /// manifest is cached for serving.
    pub fn generate_for(&self, shared: &SharedFile) -> anyhow::Result<PreviewManifest> {
        let generated = generate_preview(shared, &self.settings, &self.security)?;
        let mut manifests = self.manifests.lock().expect("preview manifests poisoned");
        let mut contents = self.contents.lock().expect("preview contents poisoned");
        for content in generated.contents {
            contents.insert((content.file_hash, content.kind), content);
        }
        manifests.insert(generated.manifest.file_hash, generated.manifest.clone());
        Ok(generated.manifest)
    }

    pub fn manifest(&self, file_hash: FileHash) -> Option<PreviewManifest> {
        self.manifests
            .lock()
            .expect("preview manifests poisoned")
            .get(&file_hash)
            .cloned()
    }

    pub fn handle_get_manifest(&self, file_hash: FileHash) -> anyhow::Result<PreviewManifest> {
        self.manifest(file_hash)
            .ok_or_else(|| NodeError::not_found("no manifest for file").into())
    }

    pub fn handle_get_content(
        &self,
        file_hash: FileHash,
        kind: PreviewKind,
        requester_peer_id: &str,
    ) -> anyhow::Result<PreviewContent> {
        let manifest = self.handle_get_manifest(file_hash)?;
        if !manifest.allow_preview {
            anyhow::bail!(NodeError::permission("preview disabled by owner"));
        }
        if let Some(trusted) = &manifest.trusted_peers_only
            && !trusted.contains(requester_peer_id)
        {
            anyhow::bail!(NodeError::permission("requester not in trusted peer set"));
        }
        if !manifest.available.contains(&kind) {
            anyhow::bail!(NodeError::not_found(format!(
                "preview kind {kind:?} not available"
            )));
        }

        if let Some(content) = self
            .contents
            .lock()
            .expect("preview contents poisoned")
            .get(&(file_hash, kind))
            .cloned()
        {
            return Ok(content);
        }

        // cache miss: regenerate from the shared file
        let shared = self
            .index
            .find_by_hash(file_hash)
            .ok_or_else(|| NodeError::not_found("file no longer shared"))?;
        let generated = generate_preview(&shared, &self.settings, &self.security)?;
        let mut contents = self.contents.lock().expect("preview contents poisoned");
        for content in generated.contents {
            contents.insert((content.file_hash, content.kind), content);
        }
        contents
            .get(&(file_hash, kind))
            .cloned()
            .ok_or_else(|| NodeError::not_found(format!("preview kind {kind:?} not available")).into())
    }
}
