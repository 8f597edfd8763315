// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_events source <key> <count>
//   demo_events monitor <key>
//
// Two processes share an event buffer under <key> (e.g. "/evdemo").
// The source pushes <count> "message" events, each carrying an event id,
// a kind tag and a string handle; the monitor attaches, drains the ring,
// resolves the strings and acknowledges progress so the source can
// recycle its string arenas.

use std::thread;

use libevbuf::{AuxHandle, BufferReader, BufferWriter, EventRecord, RETRY_SLEEP};

/// Event layout: id (u64), kind (u64), string handle (u64).
const EVENT_SIZE: u32 = 24;

fn schema() -> Vec<EventRecord> {
    vec![EventRecord::new("message", EVENT_SIZE, "s")]
}

fn do_source(key: &str, count: u64) {
    let mut buf = BufferWriter::create(key, 256, &schema()).expect("create buffer");
    buf.register_all_events();
    let kind = buf.events()[0].kind();
    println!("source: buffer '{key}' up, pushing {count} events");

    for id in 1..=count {
        loop {
            match buf.start_push() {
                Some(mut slot) => {
                    slot.write(&id.to_ne_bytes());
                    slot.write(&kind.to_ne_bytes());
                    slot.write_str(id, &format!("message #{id}"));
                    slot.commit();
                    break;
                }
                // Ring full: wait for the monitor to catch up.
                None => thread::sleep(RETRY_SLEEP),
            }
        }
    }

    // Let the monitor drain before the names disappear.
    while buf.size() > 0 {
        thread::sleep(RETRY_SLEEP);
    }
    println!("source: done, destroying buffer");
    buf.destroy();
}

fn do_monitor(key: &str) {
    let mut buf = BufferReader::attach(key).expect("attach buffer");
    println!(
        "monitor: attached to '{key}' (capacity {}, elem size {})",
        buf.capacity(),
        buf.elem_size()
    );

    let mut event = vec![0u8; buf.elem_size()];
    let mut received = 0u64;
    while buf.is_ready() {
        if !buf.pop(&mut event) {
            thread::sleep(RETRY_SLEEP);
            continue;
        }
        let id = u64::from_ne_bytes(event[0..8].try_into().unwrap());
        let kind = u64::from_ne_bytes(event[8..16].try_into().unwrap());
        let handle = AuxHandle::from_raw(u64::from_ne_bytes(event[16..24].try_into().unwrap()));
        let text = buf.get_str(handle).to_string_lossy().into_owned();
        received += 1;
        if received % 64 == 0 {
            println!("monitor: event {id} kind {kind}: {text}");
        }
        buf.set_last_processed_id(id);
    }
    println!("monitor: buffer destroyed and drained after {received} events");
    buf.release();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("source") if args.len() == 4 => {
            let count: u64 = args[3].parse().expect("count must be a number");
            do_source(&args[2], count);
        }
        Some("monitor") if args.len() == 3 => do_monitor(&args[2]),
        _ => {
            eprintln!("usage: demo_events source <key> <count>");
            eprintln!("       demo_events monitor <key>");
            std::process::exit(1);
        }
    }
}
