// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Full-stack relay tests: the real server over loopback TCP, driven by
//! the client from driftshare-core.

use std::net::SocketAddr;
use std::time::Duration;

use driftshare_core::config::RelayConfig;
use driftshare_core::identity::{FileHash, PeerIdentity};
use driftshare_core::pin::PinRelay;
use driftshare_core::relay::client::{RelayClient, RelayDownloadOptions, RelayUploadRequest};
use driftshare_core::relay::http::{self, HttpRequest};
use driftshare_core::relay::protocol::{
    HEADER_CHUNK_INDEX, HEADER_FILE_NAME, HEADER_SENDER_ID, HEADER_UPLOAD_ID,
};
use driftshare_relay::{RelayHandle, RelayServer, RelayServerConfig};
use tokio::net::TcpStream;

async fn start_relay(storage: &std::path::Path, expiry: Duration) -> RelayHandle {
    RelayServer::new(RelayServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        storage_dir: storage.to_path_buf(),
        default_expiry: expiry,
        // long sweep intervals; tests trigger sweeps explicitly
        upload_sweep_interval: Duration::from_secs(600),
        peer_sweep_interval: Duration::from_secs(600),
        ..RelayServerConfig::default()
    })
    .start()
    .await
    .expect("start relay")
}

fn client_for(handle: &RelayHandle) -> RelayClient {
    RelayClient::new(RelayConfig {
        server_url: handle.base_url(),
        chunk_size: 1024, // small chunks so tests exercise several
        ..RelayConfig::default()
    })
}

fn upload_request() -> RelayUploadRequest {
    RelayUploadRequest {
        sender_id: "peer-o".to_owned(),
        sender_name: Some("Owner".to_owned()),
        sender_public_key: [7u8; 32],
        recipient_id: None,
        mime_type: Some("application/pdf".to_owned()),
    }
}

#[tokio::test]
async fn upload_status_download_roundtrip_with_encryption() {
    let storage = tempfile::tempdir().expect("storage");
    let work = tempfile::tempdir().expect("work");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;
    let client = client_for(&handle);

    let source_path = work.path().join("doc.pdf");
    let source: Vec<u8> = (0..9_000u32).flat_map(|value| value.to_le_bytes()).collect();
    std::fs::write(&source_path, &source).expect("write source");

    let reference = client
        .upload_file(&source_path, &upload_request(), None)
        .await
        .expect("upload");
    assert!(reference.encrypted);
    assert_eq!(reference.file_size, source.len() as u64);

    let status = client
        .upload_status(&reference.upload_id)
        .await
        .expect("status");
    // no declared total ever reaches the relay, so it never claims
    // completion, even after the last chunk
    assert!(!status.complete);
    // sealed blob: nonce + tag overhead on top of the plaintext
    assert!(status.uploaded_size > source.len() as u64);
    assert!(status.chunks > 1, "small chunk size must produce several chunks");

    let destination = work.path().join("downloaded.pdf");
    client
        .download_file(
            &reference,
            &destination,
            &RelayDownloadOptions {
                owner_public_key: Some([7u8; 32]),
                verify_hash: true,
            },
            None,
        )
        .await
        .expect("download");

    let downloaded = std::fs::read(&destination).expect("read downloaded");
    assert_eq!(downloaded, source);
    assert_eq!(
        FileHash::of_bytes(&downloaded).to_hex(),
        reference.file_hash.expect("hash recorded")
    );

    handle.shutdown();
}

/// Post a single raw chunk the way the client's upload loop does,
/// without finishing the upload.
async fn post_chunk(addr: SocketAddr, upload_id: &str, chunk_index: u32, body: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = HttpRequest::new("POST", "/api/relay/upload")
        .with_header(HEADER_UPLOAD_ID, upload_id)
        .with_header(HEADER_CHUNK_INDEX, chunk_index.to_string())
        .with_header(HEADER_FILE_NAME, "partial.bin")
        .with_header(HEADER_SENDER_ID, "peer-o")
        .with_header("Content-Type", "application/octet-stream")
        .with_body(body.to_vec());
    http::write_request(&mut stream, "relay", &request)
        .await
        .expect("write chunk");
    let response = http::read_response(&mut stream).await.expect("read ack");
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn status_stays_incomplete_while_chunks_are_in_flight() {
    let storage = tempfile::tempdir().expect("storage");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;
    let client = client_for(&handle);
    let addr = handle.local_addr();

    // two of five chunks have landed
    post_chunk(addr, "up-partial", 0, &[1u8; 1024]).await;
    post_chunk(addr, "up-partial", 1, &[2u8; 1024]).await;

    let status = client.upload_status("up-partial").await.expect("status");
    assert_eq!(status.chunks, 2);
    assert_eq!(status.uploaded_size, 2 * 1024);
    assert!(
        !status.complete,
        "a partial upload must not report complete"
    );

    // the rest arrive; nothing on the wire declares a total, so the
    // server still cannot claim completion
    for chunk_index in 2..5u32 {
        post_chunk(addr, "up-partial", chunk_index, &[3u8; 1024]).await;
    }
    let status = client.upload_status("up-partial").await.expect("status");
    assert_eq!(status.chunks, 5);
    assert_eq!(status.uploaded_size, 5 * 1024);
    assert!(!status.complete);

    handle.shutdown();
}

#[tokio::test]
async fn download_resumes_from_existing_tmp() {
    let storage = tempfile::tempdir().expect("storage");
    let work = tempfile::tempdir().expect("work");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;

    // plaintext upload so the stored bytes equal the source bytes
    let mut config = RelayConfig {
        server_url: handle.base_url(),
        chunk_size: 1024,
        ..RelayConfig::default()
    };
    config.enable_encryption = false;
    let client = RelayClient::new(config);

    let source_path = work.path().join("big.bin");
    let source: Vec<u8> = (0..20_000u32).map(|value| (value % 251) as u8).collect();
    std::fs::write(&source_path, &source).expect("write source");

    let reference = client
        .upload_file(&source_path, &upload_request(), None)
        .await
        .expect("upload");

    // simulate an interrupted download: the first 5000 bytes are on disk
    let destination = work.path().join("resumed.bin");
    std::fs::write(format!("{}.tmp", destination.display()), &source[..5_000])
        .expect("seed tmp");

    client
        .download_file(
            &reference,
            &destination,
            &RelayDownloadOptions {
                owner_public_key: None,
                verify_hash: true,
            },
            None,
        )
        .await
        .expect("resume download");

    assert_eq!(std::fs::read(&destination).expect("read"), source);
    handle.shutdown();
}

#[tokio::test]
async fn peer_registry_register_list_heartbeat() {
    let storage = tempfile::tempdir().expect("storage");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;
    let client = client_for(&handle);

    let identity = PeerIdentity {
        peer_id: "peer-a".to_owned(),
        display_name: "Alice".to_owned(),
        host: "192.168.1.10".to_owned(),
        port: 9100,
        public_key: [3u8; 32],
    };
    let public_ip = client.register_peer(&identity).await.expect("register");
    // "auto" resolves to the socket's source address
    assert_eq!(public_ip, "127.0.0.1");

    let other = PeerIdentity {
        peer_id: "peer-b".to_owned(),
        display_name: "Bob".to_owned(),
        host: "192.168.1.11".to_owned(),
        port: 9101,
        public_key: [4u8; 32],
    };
    client.register_peer(&other).await.expect("register b");

    // listing excludes the requester
    let peers = client.list_peers("peer-a").await.expect("list");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "peer-b");

    client.heartbeat("peer-a").await.expect("heartbeat");
    client
        .heartbeat("peer-ghost")
        .await
        .expect_err("unknown peer heartbeat is refused");

    handle.shutdown();
}

#[tokio::test]
async fn search_index_matches_and_excludes_sender() {
    let storage = tempfile::tempdir().expect("storage");
    let work = tempfile::tempdir().expect("work");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;
    let client = client_for(&handle);

    let path = work.path().join("alpha-notes.txt");
    std::fs::write(&path, b"searchable").expect("write");
    let reference = client
        .upload_file(&path, &upload_request(), None)
        .await
        .expect("upload");
    client.register_file(&reference).await.expect("register");

    let hits = client.search_files("alpha", None).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_name, "alpha-notes.txt");

    let excluded = client
        .search_files("alpha", Some("peer-o"))
        .await
        .expect("search excluding sender");
    assert!(excluded.is_empty());

    handle.shutdown();
}

#[tokio::test]
async fn pin_create_find_and_miss() {
    let storage = tempfile::tempdir().expect("storage");
    let work = tempfile::tempdir().expect("work");
    let handle = start_relay(storage.path(), Duration::from_secs(3600)).await;
    let client = client_for(&handle);

    let path = work.path().join("doc.pdf");
    std::fs::write(&path, b"pinned content").expect("write");
    let reference = client
        .upload_file(&path, &upload_request(), None)
        .await
        .expect("upload");

    client
        .create_pin("482193", &reference, Duration::from_secs(600))
        .await
        .expect("create pin");

    let found = client
        .find_pin("482193")
        .await
        .expect("find")
        .expect("pin resolves");
    assert_eq!(found.upload_id, reference.upload_id);
    assert_eq!(found.file_name, "doc.pdf");

    assert!(client.find_pin("000000").await.expect("miss").is_none());
    handle.shutdown();
}

#[tokio::test]
async fn expiry_returns_410_then_sweeper_removes_everything() {
    let storage = tempfile::tempdir().expect("storage");
    let work = tempfile::tempdir().expect("work");
    // zero expiry: sessions lapse as soon as the clock ticks past creation
    let handle = start_relay(storage.path(), Duration::from_secs(0)).await;
    let client = client_for(&handle);

    let path = work.path().join("ephemeral.bin");
    std::fs::write(&path, b"short lived").expect("write");
    let reference = client
        .upload_file(&path, &upload_request(), None)
        .await
        .expect("upload");
    client
        .create_pin("271828", &reference, Duration::from_secs(0))
        .await
        .expect("create pin");

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // expired but not yet swept: download is Gone
    let destination = work.path().join("never.bin");
    let err = client
        .download_file(
            &reference,
            &destination,
            &RelayDownloadOptions::default(),
            None,
        )
        .await
        .expect_err("expired download must fail");
    assert!(err.to_string().contains("expired"), "got: {err}");

    // the sweeper deletes the file from disk and retires the session
    let stored_file = storage
        .path()
        .join(format!("{}_ephemeral.bin", reference.upload_id));
    assert!(stored_file.exists());
    handle.state().sweep_uploads(u64::MAX - 1);
    assert!(!stored_file.exists(), "sweep removes the stored file");

    client
        .upload_status(&reference.upload_id)
        .await
        .expect_err("status after sweep is NotFound");
    assert!(
        client.find_pin("271828").await.expect("find").is_none(),
        "pin bound to a swept upload no longer resolves"
    );

    handle.shutdown();
}
