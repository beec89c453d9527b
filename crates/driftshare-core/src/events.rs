// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::identity::{PeerIdentity, SharedFileSummary};

/// Everything a UI (an external collaborator) can observe about a running
/// node. Producers emit onto the bus and never call into consumer code; a
/// lagging or absent consumer cannot poison an emitter.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovered(PeerIdentity),
    PeerLost(PeerIdentity),
    SearchResult {
        request_id: String,
        source: PeerIdentity,
        files: Vec<SharedFileSummary>,
    },
    SearchComplete {
        request_id: String,
    },
    TransferProgress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    TransferCompleted {
        transfer_id: String,
        path: PathBuf,
    },
    /// Terminal failure; fired exactly once per transfer, after which no
    /// further progress events follow.
    TransferFailed {
        transfer_id: String,
        kind: ErrorKind,
        reason: String,
    },
    PinCreated {
        pin: String,
        file_name: String,
    },
    PinReceived {
        pin: String,
        owner: PeerIdentity,
        file_name: String,
    },
    PinExpired {
        pin: String,
    },
    PreviewReady {
        file_hash: crate::identity::FileHash,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emitting with no subscribers is fine; the event is dropped.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
