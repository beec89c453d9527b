// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;
use std::time::Duration;

/// Node-level configuration. The external CLI wrapper binds environment
/// variables onto this record; the library only consumes it.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub display_name: String,
    /// Filter directive handed to whatever subscriber the embedding
    /// process installs.
    pub log_level: String,
    /// 0 lets the OS assign the transfer/search listener port.
    pub listen_port: u16,
    pub discovery_port: u16,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    pub download_dir: PathBuf,

    pub direct_chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub connection_timeout: Duration,
    pub chunk_read_timeout: Duration,
    pub search_timeout: Duration,
    pub search_ttl: u8,
    pub enable_resume: bool,

    pub preview_max_file_size: u64,
    pub preview_thumbnail_size: u32,
    pub preview_text_max_lines: usize,
    pub preview_text_max_chars: usize,
    pub pin_lifetime: Duration,

    /// Prefer the direct path and only fall back when it loses the race.
    pub prefer_p2p: bool,
    pub force_relay: bool,
    pub p2p_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "driftshare node".to_owned(),
            log_level: "info".to_owned(),
            listen_port: 0,
            discovery_port: 8888,
            heartbeat_interval: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(45),
            download_dir: PathBuf::from("downloads"),

            direct_chunk_size: 64 * 1024,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(5),
            chunk_read_timeout: Duration::from_secs(120),
            search_timeout: Duration::from_secs(5),
            search_ttl: 2,
            enable_resume: true,

            preview_max_file_size: 100 * 1024 * 1024,
            preview_thumbnail_size: 200,
            preview_text_max_lines: 10,
            preview_text_max_chars: 500,
            pin_lifetime: Duration::from_secs(10 * 60),

            prefer_p2p: true,
            force_relay: false,
            p2p_timeout: Duration::from_secs(5),
        }
    }
}

/// Client-side relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_url: String,
    pub upload_endpoint: String,
    pub download_endpoint: String,
    pub api_key: Option<String>,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub enable_encryption: bool,
    pub enable_resume: bool,
    pub default_expiry: Duration,
    pub connection_timeout: Duration,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_owned(),
            upload_endpoint: "/api/relay/upload".to_owned(),
            download_endpoint: "/api/relay/download".to_owned(),
            api_key: None,
            chunk_size: 1024 * 1024,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            enable_encryption: true,
            enable_resume: true,
            default_expiry: Duration::from_secs(24 * 60 * 60),
            connection_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(120),
        }
    }
}

impl RelayConfig {
    /// Base URL with any trailing slash trimmed, so endpoint joins stay
    /// predictable.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn download_url(&self, upload_id: &str) -> String {
        format!("{}{}/{}", self.base_url(), self.download_endpoint, upload_id)
    }
}
