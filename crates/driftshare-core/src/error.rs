// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

/// Failure classification carried alongside every surfaced error.
///
/// Services construct [`NodeError`] values and propagate them through
/// `anyhow`; callers that need to branch (retry vs. abort) recover the
/// kind with [`error_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TLS/TCP failure, HTTP connection failure. Retryable per policy.
    Transport,
    /// Decryption tag failure, decompression failure, hash mismatch.
    /// Always fatal to the operation.
    Integrity,
    /// Unexpected command byte, malformed header, length mismatch.
    Protocol,
    /// File path absent, upload expired, PIN unknown.
    NotFound,
    /// Preview disallowed or signature verification failed.
    Permission,
    /// Operation exceeded its deadline.
    Timeout,
    /// User cancellation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Integrity => "integrity",
            Self::Protocol => "protocol",
            Self::NotFound => "not found",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }
}

/// Recover the [`ErrorKind`] from an `anyhow` chain, if one was attached.
///
/// Plain I/O or TLS errors that never passed through a [`NodeError`]
/// constructor classify as `Transport`.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(node_err) = cause.downcast_ref::<NodeError>() {
            return node_err.kind;
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorKind::Timeout;
        }
    }
    ErrorKind::Transport
}
