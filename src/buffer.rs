// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The main event buffer: an SPSC ring of fixed-size slots in a named
// shared-memory segment, together with its control segment, auxiliary
// string arenas and the dropped-range registry.
//
// Two handle types split the roles. `BufferWriter` is held by the traced
// program: it creates the segments, pushes events and is the only side
// allowed to unlink names. `BufferReader` is held by the monitor: it
// attaches to existing segments, drains the ring and publishes its
// progress, and on release only unmaps.

use std::ffi::CStr;
use std::mem::{offset_of, size_of};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aux::{AuxHandle, AuxPool};
use crate::control::{ControlSegment, EventRecord, LAST_SPECIAL_KIND};
use crate::error::{AttachError, CreateError};
use crate::shm::{self, ShmSegment};
use crate::shm_name;
use crate::spin_lock::RawSpinLock;
use crate::spsc::SpscRing;
use crate::EventId;

/// Number of slots in the dropped-range registry.
pub const DROPPED_RANGES_NUM: usize = 5;

/// Suggested sleep between push or pop retries when the peer is slow.
pub const RETRY_SLEEP: Duration = Duration::from_micros(10);

const CACHELINE: usize = 64;

/// Mode bits used when the caller passes 0.
const DEFAULT_MODE: libc::mode_t = 0o700;

#[repr(C, align(64))]
struct CacheAligned<T>(T);

/// One `[begin, end]` span of dropped event ids.
#[repr(C)]
struct DroppedRange {
    begin: AtomicU64,
    end: AtomicU64,
}

/// The shared header at the start of the main segment. Field order and
/// padding are cross-process ABI.
#[repr(C, align(64))]
pub(crate) struct BufferInfo {
    ring: SpscRing,
    allocated_size: u64,
    capacity: u64,
    elem_size: u64,
    /// Written by the reader, read by the writer's arena GC.
    last_processed_id: AtomicU64,
    dropped_ranges: [DroppedRange; DROPPED_RANGES_NUM],
    dropped_ranges_next: AtomicU64,
    dropped_ranges_lock: RawSpinLock,
    _pad_lock: [u8; 7],
    subbuffers_no: AtomicU64,
    /// Writer tells the reader the buffer is gone.
    destroyed: CacheAligned<AtomicBool>,
    /// Reader tells the writer a monitor has (ever) attached.
    monitor_attached: CacheAligned<AtomicBool>,
}

/// Offset of the slot array behind the header.
const DATA_OFFSET: usize = size_of::<BufferInfo>();

const _: () = assert!(DATA_OFFSET % CACHELINE == 0);

impl BufferInfo {
    pub(crate) fn last_processed_id(&self) -> EventId {
        self.last_processed_id.load(Ordering::Relaxed)
    }

    fn set_last_processed_id(&self, id: EventId) {
        assert!(
            self.last_processed_id() <= id,
            "last-processed event ids must be monotonic"
        );
        self.last_processed_id.store(id, Ordering::Relaxed);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.0.load(Ordering::Acquire)
    }

    fn set_destroyed(&self) {
        self.destroyed.0.store(true, Ordering::Release);
    }

    fn monitor_attached(&self) -> bool {
        self.monitor_attached.0.load(Ordering::Relaxed)
    }

    fn set_monitor_attached(&self) {
        self.monitor_attached.0.store(true, Ordering::Relaxed);
    }

    /// Record that events `[begin, end]` were discarded. If the cursor
    /// slot already starts at `begin` (or holds an empty range) the slot
    /// is extended in place; otherwise the cursor advances, overwriting
    /// the oldest remembered range.
    fn notify_dropped(&self, begin: EventId, end: EventId) {
        let idx = self.dropped_ranges_next.load(Ordering::Relaxed) as usize;
        let r = &self.dropped_ranges[idx];
        if r.begin.load(Ordering::Relaxed) == begin
            || r.end.load(Ordering::Relaxed) == r.begin.load(Ordering::Relaxed).wrapping_sub(1)
        {
            self.dropped_ranges_lock.lock();
            r.end.store(end, Ordering::Relaxed);
            self.dropped_ranges_lock.unlock();
            return;
        }

        let next = if idx + 1 == DROPPED_RANGES_NUM { 0 } else { idx + 1 };
        self.dropped_ranges_next.store(next as u64, Ordering::Relaxed);
        let r = &self.dropped_ranges[next];
        self.dropped_ranges_lock.lock();
        r.begin.store(begin, Ordering::Relaxed);
        r.end.store(end, Ordering::Relaxed);
        self.dropped_ranges_lock.unlock();
    }

    /// Whether `[first, last]` lies inside some remembered dropped range.
    pub(crate) fn range_dropped(&self, first: EventId, last: EventId) -> bool {
        self.dropped_ranges_lock.lock();
        let mut covered = false;
        for r in &self.dropped_ranges {
            let end = r.end.load(Ordering::Relaxed);
            if end == 0 {
                continue;
            }
            if r.begin.load(Ordering::Relaxed) <= first && end >= last {
                covered = true;
                break;
            }
        }
        self.dropped_ranges_lock.unlock();
        covered
    }

    /// Snapshot of the non-empty registry slots.
    fn dropped_vec(&self) -> Vec<(EventId, EventId)> {
        self.dropped_ranges_lock.lock();
        let v = self
            .dropped_ranges
            .iter()
            .filter(|r| r.end.load(Ordering::Relaxed) != 0)
            .map(|r| {
                (
                    r.begin.load(Ordering::Relaxed),
                    r.end.load(Ordering::Relaxed),
                )
            })
            .collect();
        self.dropped_ranges_lock.unlock();
        v
    }
}

pub(crate) fn info_of(seg: &ShmSegment) -> &BufferInfo {
    unsafe { &*(seg.as_ptr() as *const BufferInfo) }
}

/// Total segment size for the given geometry, page-rounded. Warns when a
/// large page tail stays unused.
fn shm_size(elem_size: usize, slots: usize) -> usize {
    let page = shm::page_size();
    let size = DATA_OFFSET + elem_size * slots;
    let rounded = size.next_multiple_of(page);
    let waste = rounded - size;
    if waste > page / 4 {
        warn!(
            "buffer geometry leaves {waste} bytes of a page unused; \
             there is room for {} more elements",
            waste / elem_size
        );
    }
    rounded
}

/// Retry schedule for [`BufferReader::attach_with`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How many times to retry after the first failed open.
    pub retries: usize,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            backoff: Duration::from_millis(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer side
// ---------------------------------------------------------------------------

/// Producer handle to an event buffer.
///
/// Owns the named segments: dropping (or [`destroy`](Self::destroy)-ing)
/// the writer marks the buffer destroyed and unlinks every name it
/// created. Readers keep draining from their own mappings until they
/// release them.
pub struct BufferWriter {
    seg: ShmSegment,
    key: String,
    control: ControlSegment,
    aux: AuxPool,
    mode: libc::mode_t,
    /// Number of the most recently created sub-buffer.
    last_subbuffer_no: u64,
}

impl BufferWriter {
    /// Create a buffer under `key` with the element size derived from the
    /// largest event in the schema.
    pub fn create(
        key: &str,
        capacity: usize,
        template: &[EventRecord],
    ) -> Result<Self, CreateError> {
        Self::create_adv(key, 0, 0, capacity, template)
    }

    /// Create a buffer with explicit mode bits and element size. Zero
    /// `mode` selects the default permissions; zero `elem_size` derives it
    /// from the schema.
    pub fn create_adv(
        key: &str,
        mode: libc::mode_t,
        elem_size: usize,
        capacity: usize,
        template: &[EventRecord],
    ) -> Result<Self, CreateError> {
        let mode = if mode == 0 { DEFAULT_MODE } else { mode };
        let control = ControlSegment::create(key, mode, template)?;
        let elem_size = if elem_size == 0 {
            control.max_event_size()
        } else {
            elem_size
        };
        match Self::init_shared(key, mode, elem_size, capacity, control) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                // Undo the half-created buffer: the control name is ours.
                let _ = ControlSegment::unlink(key);
                Err(e)
            }
        }
    }

    fn init_shared(
        key: &str,
        mode: libc::mode_t,
        elem_size: usize,
        capacity: usize,
        control: ControlSegment,
    ) -> Result<Self, CreateError> {
        if elem_size == 0 {
            return Err(CreateError::SizeInvalid("element size is 0"));
        }
        if capacity == 0 {
            return Err(CreateError::SizeInvalid("capacity is 0"));
        }

        // One extra slot backs the ring's dummy element.
        let memsize = shm_size(elem_size, capacity + 1);
        debug!(key, elem_size, capacity, memsize, "initializing buffer");

        let seg = ShmSegment::create(key, memsize, mode)?;
        unsafe {
            std::ptr::write_bytes(seg.as_ptr(), 0, size_of::<BufferInfo>());
            let info = &mut *(seg.as_ptr() as *mut BufferInfo);
            info.allocated_size = memsize as u64;
            info.capacity = capacity as u64;
            info.elem_size = elem_size as u64;
            info.ring.init(capacity);
        }

        Ok(Self {
            seg,
            key: key.to_string(),
            control,
            aux: AuxPool::new(mode),
            mode,
            last_subbuffer_no: 0,
        })
    }

    /// Create a child buffer keyed under this one. The child is a fully
    /// independent buffer: destroying the parent does not touch it. Zero
    /// `capacity` inherits the parent's.
    pub fn create_sub(
        &mut self,
        capacity: usize,
        template: &[EventRecord],
    ) -> Result<BufferWriter, CreateError> {
        self.last_subbuffer_no += 1;
        let key = shm_name::sub_buffer_key(&self.key, self.last_subbuffer_no);

        let control = ControlSegment::create(&key, self.mode, template)?;
        let elem_size = control.max_event_size();
        let capacity = if capacity == 0 {
            self.capacity()
        } else {
            capacity
        };
        let sub = match Self::init_shared(&key, self.mode, elem_size, capacity, control) {
            Ok(sub) => sub,
            Err(e) => {
                let _ = ControlSegment::unlink(&key);
                return Err(e);
            }
        };

        info_of(&self.seg)
            .subbuffers_no
            .fetch_add(1, Ordering::AcqRel);
        Ok(sub)
    }

    /// Reserve the next free slot for a broken-down push. Returns `None`
    /// when the ring is full; nothing is published until the returned
    /// guard commits.
    pub fn start_push(&mut self) -> Option<SlotGuard<'_>> {
        let info = info_of(&self.seg);
        debug_assert!(!info.is_destroyed(), "writing to a destroyed buffer");

        let (off, n) = info.ring.write_off_nowrap();
        if n == 0 {
            return None;
        }
        let elem = info.elem_size as usize;
        let base = unsafe { self.seg.as_ptr().add(DATA_OFFSET + off * elem) };
        Some(SlotGuard {
            writer: self,
            base,
            elem,
            cursor: 0,
        })
    }

    /// Copy one whole element into the ring. Returns `false` when full.
    pub fn push(&mut self, elem: &[u8]) -> bool {
        assert!(
            elem.len() <= self.elem_size(),
            "element does not fit the slot"
        );
        let Some(mut slot) = self.start_push() else {
            return false;
        };
        slot.write(elem);
        slot.commit();
        true
    }

    /// Record that events `[begin_id, end_id]` were discarded because the
    /// ring was full. Best-effort: only the five most recent ranges are
    /// remembered.
    pub fn notify_dropped(&self, begin_id: EventId, end_id: EventId) {
        info_of(&self.seg).notify_dropped(begin_id, end_id);
    }

    /// Snapshot of the dropped-range registry.
    pub fn dropped_ranges(&self) -> Vec<(EventId, EventId)> {
        info_of(&self.seg).dropped_vec()
    }

    /// Set the kind of the named record. Returns `false` if the schema
    /// has no such event.
    pub fn register_event(&self, name: &str, kind: u64) -> bool {
        match self.control.get_event(name) {
            Some(rec) => {
                rec.set_kind(kind);
                true
            }
            None => false,
        }
    }

    /// Register several events at once; stops at the first unknown name.
    pub fn register_events(&self, events: &[(&str, u64)]) -> bool {
        events.iter().all(|&(name, kind)| self.register_event(name, kind))
    }

    /// Assign consecutive kinds above the reserved range to every record,
    /// in table order.
    pub fn register_all_events(&self) {
        for (i, rec) in self.control.records().iter().enumerate() {
            rec.set_kind(1 + i as u64 + LAST_SPECIAL_KIND);
        }
    }

    /// The schema this buffer serves.
    pub fn events(&self) -> &[EventRecord] {
        self.control.records()
    }

    /// The key the buffer was created under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Usable slot count.
    pub fn capacity(&self) -> usize {
        info_of(&self.seg).capacity as usize
    }

    /// Current occupancy.
    pub fn size(&self) -> usize {
        info_of(&self.seg).ring.size()
    }

    /// Slot width in bytes.
    pub fn elem_size(&self) -> usize {
        info_of(&self.seg).elem_size as usize
    }

    /// Whether a monitor has ever attached to this buffer.
    pub fn monitor_attached(&self) -> bool {
        info_of(&self.seg).monitor_attached()
    }

    /// Lifetime count of sub-buffers created under this buffer.
    pub fn sub_buffers_no(&self) -> u64 {
        info_of(&self.seg).subbuffers_no.load(Ordering::Acquire)
    }

    /// How many distinct auxiliary arenas this writer has allocated.
    /// Stays flat while recycling keeps up with demand.
    pub fn aux_buffers_used(&self) -> usize {
        self.aux.count()
    }

    /// Tear the buffer down: mark it destroyed, unmap everything and
    /// unlink every name this writer created. Equivalent to dropping the
    /// writer.
    pub fn destroy(self) {}
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        info_of(&self.seg).set_destroyed();
        debug!(
            key = %self.key,
            aux_buffers = self.aux.count(),
            "destroying buffer"
        );

        self.aux.unlink_all();
        if let Err(e) = ShmSegment::unlink(&self.key) {
            debug!("unlinking buffer '{}': {e}", self.key);
        }
        if let Err(e) = ControlSegment::unlink(&self.key) {
            debug!("unlinking control segment of '{}': {e}", self.key);
        }
        // The mappings themselves unmap when the members drop.
    }
}

/// One reserved ring slot, filled piecewise and published on commit.
///
/// Dropping the guard without committing abandons the slot: nothing
/// becomes visible to the reader.
pub struct SlotGuard<'a> {
    writer: &'a mut BufferWriter,
    base: *mut u8,
    elem: usize,
    cursor: usize,
}

impl SlotGuard<'_> {
    /// Append raw bytes to the slot.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(
            self.cursor + bytes.len() <= self.elem,
            "write beyond the end of the slot"
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.cursor), bytes.len());
        }
        self.cursor += bytes.len();
    }

    /// Store `s` (with a trailing NUL) in an auxiliary arena under event
    /// id `evid` and append the resulting handle to the slot.
    pub fn write_str(&mut self, evid: EventId, s: &str) {
        let info = info_of(&self.writer.seg);
        let handle = self.writer.aux.push_strn(evid, s.as_bytes(), info);
        self.write_handle(handle);
    }

    /// Like [`write_str`](Self::write_str) but stores only the first `n`
    /// bytes of `s` (plus the trailing NUL).
    pub fn write_str_n(&mut self, evid: EventId, s: &str, n: usize) {
        assert!(n <= s.len(), "string prefix length out of range");
        let info = info_of(&self.writer.seg);
        let handle = self.writer.aux.push_strn(evid, &s.as_bytes()[..n], info);
        self.write_handle(handle);
    }

    fn write_handle(&mut self, handle: AuxHandle) {
        assert!(
            self.cursor + size_of::<u64>() <= self.elem,
            "write beyond the end of the slot"
        );
        unsafe {
            (self.base.add(self.cursor) as *mut u64).write_unaligned(handle.raw());
        }
        self.cursor += size_of::<u64>();
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.cursor
    }

    /// Publish the slot to the reader.
    pub fn commit(self) {
        let info = info_of(&self.writer.seg);
        debug_assert!(!info.is_destroyed(), "writing to a destroyed buffer");
        info.ring.write_finish(1);
    }
}

// ---------------------------------------------------------------------------
// Reader side
// ---------------------------------------------------------------------------

/// Consumer handle to an event buffer.
///
/// A shared view: it never unlinks names. Dropping it (or calling
/// [`release`](Self::release)) unmaps all segments; the writer's names
/// stay until the writer destroys them.
pub struct BufferReader {
    seg: ShmSegment,
    key: String,
    control: ControlSegment,
    aux: AuxPool,
}

impl BufferReader {
    /// Attach to the buffer under `key` with the default retry schedule
    /// (10 retries, 300 ms apart).
    pub fn attach(key: &str) -> Result<Self, AttachError> {
        Self::attach_with(key, &RetryPolicy::default())
    }

    /// Attach to the buffer under `key`, waiting for the writer to create
    /// it according to `retry`.
    pub fn attach_with(key: &str, retry: &RetryPolicy) -> Result<Self, AttachError> {
        debug!(key, "attaching to buffer");

        let mut attempts = 0;
        let fd = loop {
            match ShmSegment::open_fd(key) {
                Ok(fd) => break fd,
                Err(e) => {
                    attempts += 1;
                    if attempts > retry.retries {
                        return Err(AttachError::Timeout {
                            key: key.to_string(),
                            attempts,
                            source: e,
                        });
                    }
                    thread::sleep(retry.backoff);
                }
            }
        };

        let allocated =
            ShmSegment::pread_u64(&fd, offset_of!(BufferInfo, allocated_size), key)?;
        debug!(key, allocated, "mapping buffer");
        if allocated == 0 {
            return Err(AttachError::SizeInvalid {
                key: key.to_string(),
            });
        }

        let seg = ShmSegment::from_fd(fd, allocated as usize, key)?;
        let control = ControlSegment::open(key)?;

        let reader = Self {
            seg,
            key: key.to_string(),
            control,
            aux: AuxPool::new(0),
        };
        let info = info_of(&reader.seg);
        if !info.is_destroyed() {
            info.set_monitor_attached();
        }
        Ok(reader)
    }

    /// The next contiguous readable run as `(bytes, slot count)`. The
    /// slice spans whole slots; an empty ring yields `(&[], 0)`.
    pub fn read_pointer(&self) -> (&[u8], usize) {
        let info = info_of(&self.seg);
        let (off, n) = info.ring.read_off_nowrap();
        if n == 0 {
            return (&[], 0);
        }
        let elem = info.elem_size as usize;
        let bytes = unsafe {
            slice::from_raw_parts(self.seg.as_ptr().add(DATA_OFFSET + off * elem), n * elem)
        };
        (bytes, n)
    }

    /// Copy the next element into `dst`. Returns `false` when the ring is
    /// empty.
    pub fn pop(&mut self, dst: &mut [u8]) -> bool {
        let elem = self.elem_size();
        assert!(dst.len() >= elem, "destination smaller than one element");

        let copied = {
            let (bytes, n) = self.read_pointer();
            if n == 0 {
                false
            } else {
                dst[..elem].copy_from_slice(&bytes[..elem]);
                true
            }
        };
        if copied {
            info_of(&self.seg).ring.consume(1);
        }
        copied
    }

    /// Consume up to `k` slots; returns how many were consumed.
    pub fn consume(&mut self, k: usize) -> usize {
        info_of(&self.seg).ring.consume_upto(k)
    }

    /// Consume exactly `k` slots if that many are readable.
    pub fn drop_k(&mut self, k: usize) -> bool {
        info_of(&self.seg).ring.consume_upto(k) == k
    }

    /// Resolve a string handle taken out of a popped slot.
    ///
    /// The bytes stay valid until the reader tells the writer it is done
    /// with the event (via [`set_last_processed_id`](Self::set_last_processed_id))
    /// or the event falls into a dropped range.
    pub fn get_str(&mut self, handle: AuxHandle) -> &CStr {
        unsafe { CStr::from_ptr(self.aux.str_ptr(handle) as *const libc::c_char) }
    }

    /// Publish the id of the last event whose auxiliary data the monitor
    /// no longer needs. Ids must be monotonic.
    pub fn set_last_processed_id(&self, id: EventId) {
        info_of(&self.seg).set_last_processed_id(id);
    }

    /// Snapshot of the dropped-range registry.
    pub fn dropped_ranges(&self) -> Vec<(EventId, EventId)> {
        info_of(&self.seg).dropped_vec()
    }

    /// The schema served by this buffer.
    pub fn events(&self) -> &[EventRecord] {
        self.control.records()
    }

    /// A buffer stays ready while the writer is alive or unread events
    /// remain; a destroyed buffer may still be drained.
    pub fn is_ready(&self) -> bool {
        let info = info_of(&self.seg);
        !info.is_destroyed() || info.ring.size() > 0
    }

    /// Whether any monitor has ever attached (including this one).
    pub fn monitor_attached(&self) -> bool {
        info_of(&self.seg).monitor_attached()
    }

    /// The key the buffer was attached under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Usable slot count.
    pub fn capacity(&self) -> usize {
        info_of(&self.seg).capacity as usize
    }

    /// Current occupancy.
    pub fn size(&self) -> usize {
        info_of(&self.seg).ring.size()
    }

    /// Slot width in bytes.
    pub fn elem_size(&self) -> usize {
        info_of(&self.seg).elem_size as usize
    }

    /// Lifetime count of sub-buffers created under this buffer.
    pub fn sub_buffers_no(&self) -> u64 {
        info_of(&self.seg).subbuffers_no.load(Ordering::Acquire)
    }

    /// Unmap all segments without removing any names. Equivalent to
    /// dropping the reader.
    pub fn release(self) {}
}
