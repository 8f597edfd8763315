// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for auxiliary arenas and the dropped-range registry.
//
// Auxiliary segments live under the fixed `/aux.<idx>` names (a
// cross-process ABI), so tests that allocate them serialize on a local
// mutex instead of relying on unique keys.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libevbuf::{AuxHandle, BufferReader, BufferWriter, EventRecord};

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static AUX_LOCK: Mutex<()> = Mutex::new(());

fn unique_key(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/evbuf_aux.{prefix}.{}.{n}", std::process::id())
}

fn aux_guard() -> std::sync::MutexGuard<'static, ()> {
    AUX_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn str_schema() -> Vec<EventRecord> {
    vec![EventRecord::new("named", 24, "qs")]
}

/// Pop one event shaped `[id:u64][handle:u64][..]` and return both.
fn pop_event(reader: &mut BufferReader) -> (u64, AuxHandle) {
    let mut out = vec![0u8; reader.elem_size()];
    assert!(reader.pop(&mut out), "expected a readable event");
    let id = u64::from_ne_bytes(out[0..8].try_into().unwrap());
    let handle = AuxHandle::from_raw(u64::from_ne_bytes(out[8..16].try_into().unwrap()));
    (id, handle)
}

// Scenario: push one string event, decode the handle on the consumer
// side, resolve the bytes including the trailing NUL.
#[test]
fn string_handle_round_trip() {
    let _g = aux_guard();
    let key = unique_key("s3");
    let mut writer = BufferWriter::create(&key, 8, &str_schema()).expect("create");
    let mut reader = BufferReader::attach(&key).expect("attach");

    let mut slot = writer.start_push().expect("slot");
    slot.write(&7u64.to_ne_bytes());
    slot.write_str(7, "hello");
    slot.commit();

    let (id, handle) = pop_event(&mut reader);
    assert_eq!(id, 7);
    // First allocation lands at the start of the first arena.
    assert_eq!(handle.index(), 0);
    assert_eq!(handle.offset(), 0);

    let s = reader.get_str(handle);
    assert_eq!(s.to_bytes_with_nul(), b"hello\0");
}

#[test]
fn string_prefix_write() {
    let _g = aux_guard();
    let key = unique_key("strn");
    let mut writer = BufferWriter::create(&key, 8, &str_schema()).expect("create");
    let mut reader = BufferReader::attach(&key).expect("attach");

    let mut slot = writer.start_push().expect("slot");
    slot.write(&1u64.to_ne_bytes());
    slot.write_str_n(1, "hello world", 5);
    slot.commit();

    let (_, handle) = pop_event(&mut reader);
    assert_eq!(reader.get_str(handle).to_bytes_with_nul(), b"hello\0");
}

#[test]
fn consecutive_strings_share_an_arena() {
    let _g = aux_guard();
    let key = unique_key("offsets");
    let mut writer = BufferWriter::create(&key, 8, &str_schema()).expect("create");
    let mut reader = BufferReader::attach(&key).expect("attach");

    for (id, text) in [(1u64, "alpha"), (2, "beta"), (3, "gamma")] {
        let mut slot = writer.start_push().expect("slot");
        slot.write(&id.to_ne_bytes());
        slot.write_str(id, text);
        slot.commit();
    }

    let (_, h1) = pop_event(&mut reader);
    let (_, h2) = pop_event(&mut reader);
    let (_, h3) = pop_event(&mut reader);

    assert_eq!(writer.aux_buffers_used(), 1);
    assert_eq!(h1.index(), 0);
    assert_eq!(h2.index(), 0);
    // Bump allocation: "alpha\0" then "beta\0".
    assert_eq!(h1.offset(), 0);
    assert_eq!(h2.offset(), 6);
    assert_eq!(h3.offset(), 11);

    assert_eq!(reader.get_str(h3).to_bytes_with_nul(), b"gamma\0");
    assert_eq!(reader.get_str(h1).to_bytes_with_nul(), b"alpha\0");
}

// Scenario: with a consumer acknowledging progress, the writer recycles
// arenas instead of allocating fresh ones.
#[test]
fn acknowledged_progress_recycles_arenas() {
    let _g = aux_guard();
    let key = unique_key("s5");
    let mut writer = BufferWriter::create(&key, 128, &str_schema()).expect("create");
    let mut reader = BufferReader::attach(&key).expect("attach");

    let big = "x".repeat(1000);
    for id in 1..=100u64 {
        let mut slot = writer.start_push().expect("slot");
        slot.write(&id.to_ne_bytes());
        slot.write_str(id, &big);
        slot.commit();

        let (got, _) = pop_event(&mut reader);
        assert_eq!(got, id);
        reader.set_last_processed_id(id);
    }

    // Every arena filled after the first could reuse the previous one.
    assert!(
        writer.aux_buffers_used() <= 2,
        "expected arena recycling, used {}",
        writer.aux_buffers_used()
    );
}

// Without progress acknowledgements nothing may be recycled.
#[test]
fn unacknowledged_strings_grow_the_pool() {
    let _g = aux_guard();
    let key = unique_key("no_ack");
    let mut writer = BufferWriter::create(&key, 256, &str_schema()).expect("create");

    let big = "y".repeat(1000);
    for id in 1..=200u64 {
        let mut slot = writer.start_push().expect("slot");
        slot.write(&id.to_ne_bytes());
        slot.write_str(id, &big);
        slot.commit();
    }

    assert!(
        writer.aux_buffers_used() >= 2,
        "unacknowledged arenas must not be recycled"
    );
}

// An arena whose whole event range was declared dropped is recycled even
// though the consumer never advanced.
#[test]
fn dropped_range_recycles_an_arena() {
    let _g = aux_guard();
    let key = unique_key("gc_drop");
    let mut writer = BufferWriter::create(&key, 128, &str_schema()).expect("create");

    let big = "z".repeat(1000);
    let push = |id: u64, w: &mut BufferWriter| {
        let mut slot = w.start_push().expect("slot");
        slot.write(&id.to_ne_bytes());
        slot.write_str(id, &big);
        slot.commit();
    };

    // Fill the first arena (8 KiB arena, ~1 KiB strings).
    for id in 1..=8u64 {
        push(id, &mut writer);
    }
    assert_eq!(writer.aux_buffers_used(), 1);

    writer.notify_dropped(1, 8);
    for id in 9..=16u64 {
        push(id, &mut writer);
    }
    assert_eq!(
        writer.aux_buffers_used(),
        1,
        "an arena covered by a dropped range must be recycled"
    );
}

// Scenario: extending a dropped range in place leaves one registry slot
// covering the union.
#[test]
fn dropped_range_extension() {
    let key = unique_key("s6");
    let writer = BufferWriter::create_adv(&key, 0, 16, 4, &[]).expect("create");
    let reader = BufferReader::attach(&key).expect("attach");

    writer.notify_dropped(100, 100);
    writer.notify_dropped(100, 250);

    let ranges = reader.dropped_ranges();
    assert_eq!(ranges, vec![(100, 250)], "one slot must cover [100, 250]");
}

#[test]
fn distinct_drops_use_distinct_slots() {
    let key = unique_key("drop_slots");
    let writer = BufferWriter::create_adv(&key, 0, 16, 4, &[]).expect("create");

    writer.notify_dropped(10, 20);
    writer.notify_dropped(30, 40);
    writer.notify_dropped(50, 60);

    let mut ranges = writer.dropped_ranges();
    ranges.sort_unstable();
    assert_eq!(ranges, vec![(10, 20), (30, 40), (50, 60)]);
}

// The registry is a 5-slot ring: older entries get overwritten.
#[test]
fn registry_forgets_old_ranges() {
    let key = unique_key("drop_wrap");
    let writer = BufferWriter::create_adv(&key, 0, 16, 4, &[]).expect("create");

    for i in 0..7u64 {
        let begin = 100 * (i + 1);
        writer.notify_dropped(begin, begin + 1);
    }

    let ranges = writer.dropped_ranges();
    assert_eq!(ranges.len(), 5, "the registry keeps five ranges");
    assert!(
        !ranges.contains(&(100, 101)),
        "the oldest range must have been overwritten"
    );
    assert!(ranges.contains(&(700, 701)));
}
