// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control segment: the event schema shared between source and monitor.
//
// The producer writes the record table once at creation; afterwards the
// segment is immutable except for the `kind` field of individual records,
// which event registration fills in before the buffer starts serving
// reads. Record layout is part of the cross-process ABI: both sides must
// be built with the same name and signature widths.

use std::mem::size_of;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{AttachError, CreateError, NamespaceError};
use crate::shm::ShmSegment;
use crate::shm_name;

/// Width of the fixed name field in an [`EventRecord`].
pub const EVENT_NAME_MAXLEN: usize = 64;

/// Width of the fixed signature field in an [`EventRecord`].
pub const EVENT_SIG_MAXLEN: usize = 32;

/// The highest event kind reserved for built-in records; regular events
/// registered through `register_all_events` get kinds above this.
/// Kind 0 means "unregistered", kind 1 is the dropped-event record.
pub const LAST_SPECIAL_KIND: u64 = 1;

/// One event type in the schema: name, slot payload size, kind tag and
/// argument signature.
#[repr(C)]
pub struct EventRecord {
    name: [u8; EVENT_NAME_MAXLEN],
    size: u32,
    kind: AtomicU64,
    signature: [u8; EVENT_SIG_MAXLEN],
}

const _: () = assert!(size_of::<EventRecord>() == EVENT_NAME_MAXLEN + 8 + 8 + EVENT_SIG_MAXLEN);

fn fill(dst: &mut [u8], src: &str) {
    assert!(
        src.len() < dst.len(),
        "field '{src}' does not fit a {}-byte record field",
        dst.len()
    );
    dst[..src.len()].copy_from_slice(src.as_bytes());
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

impl EventRecord {
    /// Build a record for the creation template. The kind starts out
    /// unregistered (0).
    pub fn new(name: &str, size: u32, signature: &str) -> Self {
        let mut rec = Self {
            name: [0; EVENT_NAME_MAXLEN],
            size,
            kind: AtomicU64::new(0),
            signature: [0; EVENT_SIG_MAXLEN],
        };
        fill(&mut rec.name, name);
        fill(&mut rec.signature, signature);
        rec
    }

    /// Event name.
    pub fn name(&self) -> &str {
        field_str(&self.name)
    }

    /// Payload size of this event in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Registered kind; 0 while unregistered.
    pub fn kind(&self) -> u64 {
        self.kind.load(Ordering::Relaxed)
    }

    /// Set the kind. Idempotent per record; must happen before the buffer
    /// starts serving reads.
    pub fn set_kind(&self, kind: u64) {
        self.kind.store(kind, Ordering::Relaxed);
    }

    /// Argument signature string.
    pub fn signature(&self) -> &str {
        field_str(&self.signature)
    }
}

/// Size of the length prefix in front of the record table.
const CTRL_HEADER: usize = size_of::<u64>();

/// A mapped control segment.
pub struct ControlSegment {
    seg: ShmSegment,
}

impl ControlSegment {
    /// Create the control segment for the buffer under `buf_key` and copy
    /// the record template into it.
    ///
    /// An empty template still produces a segment large enough to hold the
    /// size field, so attach always finds something to read.
    pub fn create(
        buf_key: &str,
        mode: libc::mode_t,
        template: &[EventRecord],
    ) -> Result<Self, CreateError> {
        let key = shm_name::ctrl_key(buf_key);
        let size = CTRL_HEADER + template.len() * size_of::<EventRecord>();
        debug!(key, size, records = template.len(), "creating control segment");

        let seg = ShmSegment::create(&key, size, mode)?;
        unsafe {
            (seg.as_ptr() as *mut u64).write(size as u64);
            std::ptr::copy_nonoverlapping(
                template.as_ptr() as *const u8,
                seg.as_ptr().add(CTRL_HEADER),
                template.len() * size_of::<EventRecord>(),
            );
        }
        Ok(Self { seg })
    }

    /// Map the control segment of the buffer under `buf_key`.
    pub fn open(buf_key: &str) -> Result<Self, AttachError> {
        let key = shm_name::ctrl_key(buf_key);
        let fd = ShmSegment::open_fd(&key)?;
        let size = ShmSegment::pread_u64(&fd, 0, &key)?;
        debug!(key, size, "opening control segment");
        if size == 0 {
            return Err(AttachError::SizeInvalid { key });
        }
        let seg = ShmSegment::from_fd(fd, size as usize, &key)?;
        Ok(Self { seg })
    }

    /// Number of records in the table.
    pub fn records_num(&self) -> usize {
        (self.seg.len() - CTRL_HEADER) / size_of::<EventRecord>()
    }

    /// The record table.
    pub fn records(&self) -> &[EventRecord] {
        unsafe {
            slice::from_raw_parts(
                self.seg.as_ptr().add(CTRL_HEADER) as *const EventRecord,
                self.records_num(),
            )
        }
    }

    /// The largest payload size over all records; 0 for an empty schema.
    pub fn max_event_size(&self) -> usize {
        self.records().iter().map(|r| r.size() as usize).max().unwrap_or(0)
    }

    /// Linear scan for a record by name.
    pub fn get_event(&self, name: &str) -> Option<&EventRecord> {
        self.records().iter().find(|r| r.name() == name)
    }

    /// Remove the backing name. Producer-side teardown only.
    pub(crate) fn unlink(buf_key: &str) -> Result<(), NamespaceError> {
        ShmSegment::unlink(&shm_name::ctrl_key(buf_key))
    }
}
