// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the control segment: schema creation, attach-side mapping,
// lookups and event-kind registration.

use std::sync::atomic::{AtomicUsize, Ordering};

use libevbuf::{shm_name, BufferWriter, ControlSegment, EventRecord, ShmSegment, LAST_SPECIAL_KIND};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_key(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/evbuf_ctrl.{prefix}.{}.{n}", std::process::id())
}

fn sample_schema() -> Vec<EventRecord> {
    vec![
        EventRecord::new("open", 24, "sii"),
        EventRecord::new("read", 40, "ipl"),
        EventRecord::new("close", 16, "i"),
    ]
}

fn cleanup(buf_key: &str) {
    let _ = ShmSegment::unlink(&shm_name::ctrl_key(buf_key));
}

#[test]
fn create_then_open_sees_the_template() {
    let key = unique_key("roundtrip");
    let created = ControlSegment::create(&key, 0o700, &sample_schema()).expect("create");
    assert_eq!(created.records_num(), 3);

    let opened = ControlSegment::open(&key).expect("open");
    assert_eq!(opened.records_num(), 3);

    let names: Vec<&str> = opened.records().iter().map(|r| r.name()).collect();
    assert_eq!(names, ["open", "read", "close"]);
    assert_eq!(opened.records()[1].size(), 40);
    assert_eq!(opened.records()[1].signature(), "ipl");
    // Unregistered records carry kind 0.
    assert!(opened.records().iter().all(|r| r.kind() == 0));

    cleanup(&key);
}

#[test]
fn max_event_size_is_the_largest_record() {
    let key = unique_key("max_size");
    let ctrl = ControlSegment::create(&key, 0o700, &sample_schema()).expect("create");
    assert_eq!(ctrl.max_event_size(), 40);
    cleanup(&key);
}

#[test]
fn empty_schema_still_has_a_segment() {
    let key = unique_key("empty");
    let ctrl = ControlSegment::create(&key, 0o700, &[]).expect("create");
    assert_eq!(ctrl.records_num(), 0);
    assert_eq!(ctrl.max_event_size(), 0);

    let opened = ControlSegment::open(&key).expect("open");
    assert_eq!(opened.records_num(), 0);

    cleanup(&key);
}

#[test]
fn get_event_finds_by_name() {
    let key = unique_key("lookup");
    let ctrl = ControlSegment::create(&key, 0o700, &sample_schema()).expect("create");

    let rec = ctrl.get_event("read").expect("record should exist");
    assert_eq!(rec.size(), 40);
    assert!(ctrl.get_event("write").is_none());

    cleanup(&key);
}

#[test]
fn open_missing_control_fails() {
    let key = unique_key("missing");
    cleanup(&key);
    assert!(ControlSegment::open(&key).is_err());
}

// Kind registration is a shared-memory write: another mapping sees it.
#[test]
fn registered_kinds_cross_mappings() {
    let key = unique_key("kinds");
    let created = ControlSegment::create(&key, 0o700, &sample_schema()).expect("create");
    let opened = ControlSegment::open(&key).expect("open");

    created.get_event("read").unwrap().set_kind(7);
    assert_eq!(opened.get_event("read").unwrap().kind(), 7);

    cleanup(&key);
}

#[test]
fn register_all_assigns_consecutive_kinds() {
    let key = unique_key("reg_all");
    let writer = BufferWriter::create(&key, 8, &sample_schema()).expect("create buffer");

    writer.register_all_events();
    for (i, rec) in writer.events().iter().enumerate() {
        assert_eq!(rec.kind(), 1 + i as u64 + LAST_SPECIAL_KIND);
    }
    // Registration is idempotent per record.
    writer.register_all_events();
    assert_eq!(writer.events()[0].kind(), 1 + LAST_SPECIAL_KIND);
}

#[test]
fn register_named_events() {
    let key = unique_key("reg_named");
    let writer = BufferWriter::create(&key, 8, &sample_schema()).expect("create buffer");

    assert!(writer.register_event("open", 10));
    assert!(!writer.register_event("nonexistent", 11));
    assert!(writer.register_events(&[("read", 12), ("close", 13)]));
    assert!(!writer.register_events(&[("close", 13), ("bogus", 14)]));

    assert_eq!(writer.events()[0].kind(), 10);
    assert_eq!(writer.events()[1].kind(), 12);
    assert_eq!(writer.events()[2].kind(), 13);
}
