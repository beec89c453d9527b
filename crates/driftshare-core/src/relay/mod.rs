// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
pub mod client;
pub mod http;
pub mod protocol;

pub use client::{RelayClient, RelayDownloadOptions, RelayUploadRequest};
pub use protocol::RelayFileRef;
