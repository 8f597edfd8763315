// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer/single-consumer ring-buffer header for shared memory.
//
// The header only manages indices; slot storage lives elsewhere in the
// segment. One extra dummy slot distinguishes full from empty, so a ring
// initialised with capacity C owns C + 1 slots. Capacities need not be
// powers of two; indices wrap by comparison, not masking.
//
// Ordering protocol: the producer publishes slots with a release store on
// the write index and acquires the read index to learn free space; the
// consumer publishes consumption with a release store on the read index
// and acquires the write index to learn occupancy.

use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

const CACHELINE: usize = 64;
const PAD: usize = CACHELINE - size_of::<AtomicUsize>();

/// SPSC ring header (192 bytes, one cache line per field).
#[repr(C, align(64))]
pub struct SpscRing {
    /// Producer index: next slot to write (written by producer).
    write: AtomicUsize,
    _pad0: [u8; PAD],

    /// Consumer index: next slot to read (written by consumer).
    read: AtomicUsize,
    _pad1: [u8; PAD],

    /// Total slot count including the dummy slot (immutable after init).
    slots: usize,
    _pad2: [u8; PAD],
}

const _: () = assert!(size_of::<SpscRing>() == 192);

impl SpscRing {
    /// Initialise a ring with the given usable capacity.
    ///
    /// The caller must have reserved storage for `capacity + 1` slots.
    pub fn init(&mut self, capacity: usize) {
        assert!(capacity > 0, "ring capacity is 0");
        self.write = AtomicUsize::new(0);
        self.read = AtomicUsize::new(0);
        self.slots = capacity + 1;
    }

    /// Usable capacity (one less than the allocated slot count).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots - 1
    }

    #[inline]
    fn wrap(&self, idx: usize) -> usize {
        if idx >= self.slots {
            idx - self.slots
        } else {
            idx
        }
    }

    /// Current occupancy.
    #[inline]
    pub fn size(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            self.slots - r + w
        }
    }

    /// Contiguous writable run starting at the write index.
    ///
    /// Returns `(offset, n)` where `n` slots may be written at slot offset
    /// `offset` without crossing the physical end of the array. `n == 0`
    /// iff the ring is full.
    #[inline]
    pub fn write_off_nowrap(&self) -> (usize, usize) {
        let w = self.write.load(Ordering::Relaxed);
        let r = self.read.load(Ordering::Acquire);
        let n = if w >= r {
            // Can run to the physical end, but must not catch up with a
            // reader parked at slot 0 (the dummy slot rule).
            self.slots - w - usize::from(r == 0)
        } else {
            r - w - 1
        };
        (w, n)
    }

    /// Publish `n` previously written slots.
    #[inline]
    pub fn write_finish(&self, n: usize) {
        let w = self.write.load(Ordering::Relaxed);
        debug_assert!(n <= self.capacity());
        self.write.store(self.wrap(w + n), Ordering::Release);
    }

    /// Contiguous readable run starting at the read index.
    ///
    /// Returns `(offset, n)`; `n == 0` iff the ring is empty.
    #[inline]
    pub fn read_off_nowrap(&self) -> (usize, usize) {
        let r = self.read.load(Ordering::Relaxed);
        let w = self.write.load(Ordering::Acquire);
        let n = if w >= r { w - r } else { self.slots - r };
        (r, n)
    }

    /// Consume exactly `n` slots. The caller must know they are readable.
    #[inline]
    pub fn consume(&self, n: usize) {
        let r = self.read.load(Ordering::Relaxed);
        debug_assert!(n <= self.size());
        self.read.store(self.wrap(r + n), Ordering::Release);
    }

    /// Consume up to `n` slots; returns how many were actually consumed.
    #[inline]
    pub fn consume_upto(&self, n: usize) -> usize {
        let k = n.min(self.size());
        if k > 0 {
            self.consume(k);
        }
        k
    }
}
