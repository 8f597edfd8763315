// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Auxiliary buffers: variable-length byte arenas referenced from ring
// slots through packed 64-bit handles.
//
// Each arena is its own named segment under `/aux.<idx>`. The producer
// bump-allocates into the current arena and recycles old ones once the
// consumer's progress (or a recorded dropped range) proves no live event
// can still reference them. The consumer maps arenas lazily, on the first
// handle that points into them.
//
// Allocation failures here are fatal by design: they mean the consumer
// has stopped making progress and the transport cannot recover in-band.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::{debug, error};

use crate::buffer::BufferInfo;
use crate::shm::{self, ShmSegment};
use crate::shm_name;
use crate::EventId;

/// A packed reference to bytes in an auxiliary segment:
/// `(segment index << 32) | byte offset`. The encoding is a cross-process
/// ABI and must not change. 0 is reserved for "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AuxHandle(u64);

impl AuxHandle {
    /// Pack a segment index and byte offset.
    pub fn pack(idx: u64, offset: u32) -> Self {
        Self((idx << 32) | offset as u64)
    }

    /// Rebuild a handle from its wire representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The wire representation stored inside ring slots.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Index of the auxiliary segment the handle points into.
    pub fn index(self) -> u64 {
        self.0 >> 32
    }

    /// Byte offset inside the segment's data area.
    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Whether this is the reserved "no handle" value.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Shared header at the start of every auxiliary segment.
#[repr(C)]
pub(crate) struct AuxHeader {
    /// Usable data bytes behind the header (immutable after creation).
    size: u64,
    /// Bump-allocation cursor.
    head: AtomicU64,
    /// Segment index (immutable after creation).
    idx: u64,
    /// First event id that stored data here; 0 while unused.
    first_event_id: AtomicU64,
    /// Last event id that stored data here; u64::MAX while open-ended.
    last_event_id: AtomicU64,
    /// Set once the segment may be recycled.
    reusable: AtomicU8,
    _pad: [u8; 7],
}

pub(crate) const AUX_HEADER_SIZE: usize = size_of::<AuxHeader>();

const _: () = assert!(AUX_HEADER_SIZE == 48);

/// One mapped auxiliary segment.
pub(crate) struct AuxSegment {
    seg: ShmSegment,
}

impl AuxSegment {
    /// Create a fresh arena able to hold at least `want` bytes. The
    /// segment is page-rounded with one spare page of slack.
    ///
    /// Panics on namespace failure: see the module note on fatality.
    fn create(idx: u64, want: usize, mode: libc::mode_t) -> Self {
        let page = shm::page_size();
        let total = ((want + AUX_HEADER_SIZE).div_ceil(page) + 1) * page;
        let data_size = total - AUX_HEADER_SIZE;
        // Offsets must fit the 32-bit half of a handle.
        assert!(
            (data_size as u64) < (1u64 << 32),
            "auxiliary segment of {data_size} bytes exceeds the 4 GiB handle range"
        );

        let key = shm_name::aux_key(idx);
        let seg = match ShmSegment::create(&key, total, mode) {
            Ok(seg) => seg,
            Err(e) => {
                error!("allocating auxiliary buffer '{key}': {e}");
                panic!("out of auxiliary buffer space: {e}");
            }
        };

        let ab = Self { seg };
        unsafe {
            let h = &mut *(ab.seg.as_ptr() as *mut AuxHeader);
            h.size = data_size as u64;
            h.head = AtomicU64::new(0);
            h.idx = idx;
            h.first_event_id = AtomicU64::new(0);
            h.last_event_id = AtomicU64::new(u64::MAX);
            h.reusable = AtomicU8::new(0);
        }
        ab
    }

    /// Map the arena with the given index. Consumer side.
    ///
    /// Panics on failure: a handle pointing at an unopenable segment means
    /// the two sides disagree about the world.
    fn open(idx: u64) -> Self {
        let key = shm_name::aux_key(idx);
        let open = || -> Result<ShmSegment, crate::error::NamespaceError> {
            let fd = ShmSegment::open_fd(&key)?;
            let size = ShmSegment::pread_u64(&fd, 0, &key)?;
            ShmSegment::from_fd(fd, size as usize + AUX_HEADER_SIZE, &key)
        };
        let seg = match open() {
            Ok(seg) => seg,
            Err(e) => {
                error!("resolving handle into auxiliary buffer '{key}': {e}");
                panic!("invalid auxiliary handle: {e}");
            }
        };
        let ab = Self { seg };
        assert!(ab.header().idx == idx, "auxiliary segment carries the wrong index");
        assert!(ab.header().size > 0);
        ab
    }

    fn header(&self) -> &AuxHeader {
        unsafe { &*(self.seg.as_ptr() as *const AuxHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.seg.as_ptr().add(AUX_HEADER_SIZE) }
    }

    fn idx(&self) -> u64 {
        self.header().idx
    }

    fn data_size(&self) -> u64 {
        self.header().size
    }

    fn free_space(&self) -> u64 {
        let h = self.header();
        h.size - h.head.load(Ordering::Relaxed)
    }

    /// Copy `bytes` plus a trailing NUL at the cursor; returns the offset
    /// the data starts at.
    fn append(&self, bytes: &[u8]) -> u32 {
        let h = self.header();
        let off = h.head.load(Ordering::Relaxed);
        debug_assert!(off + bytes.len() as u64 + 1 <= h.size);
        unsafe {
            let dst = self.data_ptr().add(off as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            dst.add(bytes.len()).write(0);
        }
        h.head.store(off + bytes.len() as u64 + 1, Ordering::Relaxed);
        off as u32
    }

    /// Reset the arena for a new round of allocations.
    fn mark_reusable(&self) {
        let h = self.header();
        h.reusable.store(1, Ordering::Relaxed);
        h.head.store(0, Ordering::Relaxed);
        h.first_event_id.store(0, Ordering::Relaxed);
        h.last_event_id.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Process-local view of a buffer's auxiliary segments.
///
/// The writer keeps every arena it created plus an age order over them;
/// the reader only caches the arenas it has resolved handles into.
pub(crate) struct AuxPool {
    segments: Vec<AuxSegment>,
    /// Indices into `segments`, oldest first. The current arena is always
    /// the last entry. Writer side only.
    age: Vec<usize>,
    /// Position in `segments` of the arena used for the next allocation
    /// (writer) or the last resolved handle (reader).
    current: Option<usize>,
    /// Next never-reused segment index.
    next_idx: u64,
    mode: libc::mode_t,
}

impl AuxPool {
    pub(crate) fn new(mode: libc::mode_t) -> Self {
        Self {
            segments: Vec::new(),
            age: Vec::new(),
            current: None,
            next_idx: 0,
            mode,
        }
    }

    /// How many distinct arenas this pool has seen.
    pub(crate) fn count(&self) -> usize {
        self.segments.len()
    }

    /// Pick (or create) an arena with at least `need` free bytes.
    ///
    /// Oldest arenas are recycled first, and only once every event that
    /// may reference them was either consumed or declared dropped.
    fn select(&mut self, need: usize, info: &BufferInfo) -> usize {
        if let Some(c) = self.current {
            if self.segments[c].free_space() >= need as u64 {
                return c;
            }
        }

        let last_processed = info.last_processed_id();
        for pos in 0..self.age.len() {
            let si = self.age[pos];
            let ab = &self.segments[si];
            let h = ab.header();
            let first = h.first_event_id.load(Ordering::Relaxed);
            let last = h.last_event_id.load(Ordering::Relaxed);
            if last <= last_processed || info.range_dropped(first, last) {
                ab.mark_reusable();
            }
            if h.reusable.load(Ordering::Relaxed) != 0 && ab.data_size() >= need as u64 {
                h.reusable.store(0, Ordering::Relaxed);
                let entry = self.age.remove(pos);
                self.age.push(entry);
                self.current = Some(si);
                return si;
            }
        }

        let idx = self.next_idx;
        self.next_idx += 1;
        debug!(idx, need, "allocating auxiliary buffer");
        self.segments.push(AuxSegment::create(idx, need, self.mode));
        let si = self.segments.len() - 1;
        self.age.push(si);
        self.current = Some(si);
        si
    }

    /// Store `bytes` (NUL-terminated) for the event `evid`; returns the
    /// packed handle. Writer side.
    pub(crate) fn push_strn(&mut self, evid: EventId, bytes: &[u8], info: &BufferInfo) -> AuxHandle {
        let si = self.select(bytes.len() + 1, info);
        let ab = &self.segments[si];
        let off = ab.append(bytes);

        let h = ab.header();
        if h.first_event_id.load(Ordering::Relaxed) == 0 {
            h.first_event_id.store(evid, Ordering::Relaxed);
        }
        h.last_event_id.store(evid, Ordering::Relaxed);

        AuxHandle::pack(ab.idx(), off)
    }

    fn lookup(&self, idx: u64) -> Option<usize> {
        if let Some(c) = self.current {
            if self.segments[c].idx() == idx {
                return Some(c);
            }
        }
        self.segments.iter().position(|a| a.idx() == idx)
    }

    /// Resolve a handle to a raw data pointer, mapping the arena on first
    /// use. Reader side.
    pub(crate) fn str_ptr(&mut self, handle: AuxHandle) -> *const u8 {
        let pos = match self.lookup(handle.index()) {
            Some(pos) => pos,
            None => {
                self.segments.push(AuxSegment::open(handle.index()));
                self.segments.len() - 1
            }
        };
        self.current = Some(pos);
        let ab = &self.segments[pos];
        debug_assert!((handle.offset() as u64) < ab.data_size());
        unsafe { ab.data_ptr().add(handle.offset() as usize) }
    }

    /// Remove the names of all arenas this pool created. Writer teardown.
    pub(crate) fn unlink_all(&self) {
        for ab in &self.segments {
            let key = shm_name::aux_key(ab.idx());
            if let Err(e) = ShmSegment::unlink(&key) {
                debug!("unlinking auxiliary buffer '{key}': {e}");
            }
        }
    }
}
