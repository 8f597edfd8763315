// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types for segment creation and monitor attachment.
//
// Full/empty conditions on the ring are not errors: push returns `None` /
// `false` and pop returns `false`, and the caller decides whether to retry
// or record a dropped range.

use std::io;

use thiserror::Error;

/// A shared-memory namespace operation failed.
///
/// Carries the operation name, the buffer key involved and the underlying
/// OS error.
#[derive(Debug, Error)]
#[error("shared memory {op} failed for key '{key}': {source}")]
pub struct NamespaceError {
    pub(crate) op: &'static str,
    pub(crate) key: String,
    #[source]
    pub(crate) source: io::Error,
}

impl NamespaceError {
    pub(crate) fn new(op: &'static str, key: &str, source: io::Error) -> Self {
        Self {
            op,
            key: key.to_string(),
            source,
        }
    }

    /// The shared-memory key the failing operation was applied to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The underlying OS error.
    pub fn os_error(&self) -> &io::Error {
        &self.source
    }
}

/// Errors returned from producer-side buffer creation.
#[derive(Debug, Error)]
pub enum CreateError {
    /// shm open/truncate/map failed.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    /// Zero element size or zero capacity.
    #[error("invalid buffer geometry: {0}")]
    SizeInvalid(&'static str),
}

/// Errors returned from consumer-side attach.
#[derive(Debug, Error)]
pub enum AttachError {
    /// shm open/map failed after the segment was found.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    /// The mapped segment reports a zero allocated size.
    #[error("buffer '{key}' reports a zero allocated size")]
    SizeInvalid { key: String },

    /// No segment appeared under the key before the retry budget ran out.
    #[error("no buffer appeared under '{key}' within {attempts} attempts")]
    Timeout {
        key: String,
        attempts: usize,
        #[source]
        source: NamespaceError,
    },
}
