// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory event transport for runtime monitoring.
//
// A traced program (the writer) streams fixed-size event records through
// a single-producer/single-consumer ring buffer in a named shared-memory
// segment; a monitor process (the reader) attaches later and drains it.
// Variable-length data rides in auxiliary arenas referenced by packed
// 64-bit handles, reclaimed as the reader publishes its progress. A
// control segment carries the event schema, and a small registry lets the
// writer tell the reader about event-id gaps caused by back-pressure.

pub mod shm_name;

mod shm;
pub use shm::ShmSegment;

mod error;
pub use error::{AttachError, CreateError, NamespaceError};

mod spin_lock;
pub use spin_lock::RawSpinLock;

mod spsc;
pub use spsc::SpscRing;

mod control;
pub use control::{
    ControlSegment, EventRecord, EVENT_NAME_MAXLEN, EVENT_SIG_MAXLEN, LAST_SPECIAL_KIND,
};

mod aux;
pub use aux::AuxHandle;

mod buffer;
pub use buffer::{
    BufferReader, BufferWriter, RetryPolicy, SlotGuard, DROPPED_RANGES_NUM, RETRY_SLEEP,
};

/// Monotonic per-buffer event id assigned by the writer; 0 means "none".
pub type EventId = u64;
