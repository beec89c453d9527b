// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::Mutex;

use driftshare_core::relay::protocol::RelayFileRef;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PinRecord {
    file: RelayFileRef,
    expires_at_unix: u64,
}

/// Search index over relay-hosted files plus the PIN registry. Both are
/// keyed by upload id, so sweeping an upload also retires its entries.
#[derive(Debug, Default)]
pub struct RelayIndex {
    files: Mutex<HashMap<String, RelayFileRef>>,
    pins: Mutex<HashMap<String, PinRecord>>,
}

impl RelayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_file(&self, reference: RelayFileRef) {
        info!(upload_id = %reference.upload_id, file = %reference.file_name,
            "file registered for search");
        self.files
            .lock()
            .expect("relay index poisoned")
            .insert(reference.upload_id.clone(), reference);
    }

    /// Case-insensitive substring match on the file name.
    pub fn search(&self, query: &str, exclude_sender: Option<&str>) -> Vec<RelayFileRef> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return vec![];
        }
        let files = self.files.lock().expect("relay index poisoned");
        files
            .values()
            .filter(|reference| reference.file_name.to_lowercase().contains(&needle))
            .filter(|reference| Some(reference.sender_id.as_str()) != exclude_sender)
            .cloned()
            .collect()
    }

    pub fn create_pin(&self, pin: &str, file: RelayFileRef, expires_at_unix: u64) {
        info!(pin, upload_id = %file.upload_id, "pin bound");
        self.pins.lock().expect("relay index poisoned").insert(
            pin.to_owned(),
            PinRecord {
                file,
                expires_at_unix,
            },
        );
    }

    /// Resolve a PIN; expired bindings do not resolve.
    pub fn find_pin(&self, pin: &str, now_unix: u64) -> Option<RelayFileRef> {
        let pins = self.pins.lock().expect("relay index poisoned");
        pins.get(pin)
            .filter(|record| now_unix <= record.expires_at_unix)
            .map(|record| record.file.clone())
    }

    /// Retire entries for uploads the store has swept.
    pub fn remove_uploads(&self, upload_ids: &[String]) {
        if upload_ids.is_empty() {
            return;
        }
        let mut files = self.files.lock().expect("relay index poisoned");
        let mut pins = self.pins.lock().expect("relay index poisoned");
        for upload_id in upload_ids {
            files.remove(upload_id);
            pins.retain(|_, record| &record.file.upload_id != upload_id);
        }
        debug!(count = upload_ids.len(), "index entries retired with uploads");
    }

    pub fn sweep_pins(&self, now_unix: u64) -> usize {
        let mut pins = self.pins.lock().expect("relay index poisoned");
        let before = pins.len();
        pins.retain(|_, record| now_unix <= record.expires_at_unix);
        before - pins.len()
    }
}
