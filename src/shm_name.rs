// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Key validation and derivation for the shared-memory namespace.
//
// One buffer owns up to three families of named segments: the data segment
// under the user-supplied key, the control segment under a derived key, and
// any number of auxiliary string arenas under `/aux.<idx>`. The derivations
// here are part of the cross-process ABI and must not change.

use std::io;

use crate::error::NamespaceError;

/// Maximum length of a shared-memory key, including the leading '/'.
pub const KEY_MAXLEN: usize = 255;

/// Check that `key` is usable as a POSIX shm name.
///
/// Keys must start with '/', be at most [`KEY_MAXLEN`] bytes and contain
/// no interior NUL.
pub fn validate_key(key: &str) -> Result<(), NamespaceError> {
    let invalid = |msg: &str| {
        NamespaceError::new(
            "key validation",
            key,
            io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()),
        )
    };

    if !key.starts_with('/') || key.len() < 2 {
        return Err(invalid("key must start with '/' and name a segment"));
    }
    if key.len() > KEY_MAXLEN {
        return Err(invalid("key exceeds the shm name limit"));
    }
    if key.as_bytes().contains(&0) {
        return Err(invalid("key contains an interior NUL"));
    }
    Ok(())
}

/// Key of the control segment belonging to the buffer under `key`.
///
/// The mapping is injective: two distinct buffer keys never share a
/// control key.
pub fn ctrl_key(key: &str) -> String {
    format!("{key}.ctrl")
}

/// Key of the auxiliary segment with the given index.
pub fn aux_key(idx: u64) -> String {
    format!("/aux.{idx}")
}

/// Key of the `n`-th sub-buffer of the buffer under `parent`.
/// Sub-buffers are numbered from 1.
pub fn sub_buffer_key(parent: &str, n: u64) -> String {
    format!("{parent}.sub.{n}")
}
