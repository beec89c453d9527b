// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;

use driftshare_relay::{RelayServer, RelayServerConfig};
use tracing_subscriber::EnvFilter;

/// Standalone relay: `driftshare-relay [port] [storage-dir]`, with
/// `DRIFTSHARE_RELAY_API_KEY` optionally enabling upload authentication.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .map(|raw| raw.parse())
        .transpose()?
        .unwrap_or(8080);
    let storage_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay-storage"));

    let config = RelayServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        storage_dir,
        api_key: std::env::var("DRIFTSHARE_RELAY_API_KEY").ok(),
        ..RelayServerConfig::default()
    };

    let handle = RelayServer::new(config).start().await?;
    tracing::info!(url = %handle.base_url(), "relay ready");

    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    Ok(())
}
