// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One-byte test-and-test-and-set spinlock with adaptive backoff.
//
// Lives inside shared-memory headers, so it must be exactly one byte and
// must never hold process-local state. Critical sections guarded by it are
// bounded (a scan over the five dropped-range slots), which is why a
// spinlock is acceptable here at all.

use std::sync::atomic::{AtomicBool, Ordering};

/// Adaptive backoff while waiting on a contended lock.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A one-byte spinlock shared between processes.
///
/// `#[repr(transparent)]` over an `AtomicBool` so it can sit in a
/// `#[repr(C)]` shared header at a fixed offset. All-zero bytes are the
/// unlocked state, matching freshly truncated segments.
#[repr(transparent)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// A new unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning with adaptive backoff.
    pub fn lock(&self) {
        let mut k = 0u32;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                adaptive_yield(&mut k);
            }
        }
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}
