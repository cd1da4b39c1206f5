//! In-memory scan iterator behavior.

mod common;

use std::collections::HashMap;

use tidekv::{SimpleDeleteContext, SimpleUpsertContext, Status};

#[test]
fn scan_sees_every_record() {
    let store = common::small_store(128);
    let mut session = store.open_session();

    for key in 0u64..256 {
        assert_eq!(
            session.upsert(&SimpleUpsertContext::new(key, 23u64), key + 1),
            Status::Ok
        );
    }

    let mut iter = store.scan_in_memory();
    let mut seen = HashMap::new();
    while let Some(record) = iter.get_next() {
        seen.insert(*record.key(), *record.value());
    }
    assert_eq!(seen.len(), 256);
    for key in 0u64..256 {
        assert_eq!(seen.get(&key), Some(&23));
    }
}

#[test]
fn iterator_bounds_are_fixed_at_creation() {
    let store = common::small_store(128);
    let mut session = store.open_session();

    session.upsert(&SimpleUpsertContext::new(0, 23u64), 1);
    let mut iter = store.scan_in_memory();

    // A later overwrite appends beyond the iterator's end bound.
    session.upsert(&SimpleUpsertContext::new(0, 42u64), 2);

    let record = iter.get_next().expect("one record in range");
    assert_eq!(*record.key(), 0);
    assert_eq!(*record.value(), 23);
    assert!(iter.get_next().is_none());
}

#[test]
fn superseded_records_both_appear() {
    // The scan walks the log, not the index: an overwritten key shows up
    // once per surviving record.
    let store = common::small_store(128);
    let mut session = store.open_session();

    session.upsert(&SimpleUpsertContext::new(1, 10u64), 1);
    session.upsert(&SimpleUpsertContext::new(1, 20u64), 2);

    let mut iter = store.scan_in_memory();
    let mut values = Vec::new();
    while let Some(record) = iter.get_next() {
        assert_eq!(*record.key(), 1);
        values.push(*record.value());
    }
    assert_eq!(values, vec![10, 20]);
}

#[test]
fn tombstones_are_skipped() {
    let store = common::small_store(128);
    let mut session = store.open_session();

    session.upsert(&SimpleUpsertContext::new(1, 10u64), 1);
    session.upsert(&SimpleUpsertContext::new(2, 20u64), 2);
    session.delete(&SimpleDeleteContext::new(1), 3);

    let mut iter = store.scan_in_memory();
    let mut live = Vec::new();
    while let Some(record) = iter.get_next() {
        live.push((*record.key(), *record.value()));
    }
    // The two data records survive; the tombstone itself is skipped.
    assert_eq!(live, vec![(1, 10), (2, 20)]);
}

#[test]
fn scan_crosses_page_boundaries() {
    // 4 KiB pages hold ~170 records of 24 bytes; 1000 records span several
    // pages, exercising the straddle-waste jump.
    let store = common::small_store(256);
    let mut session = store.open_session();

    for key in 0u64..1000 {
        assert_eq!(
            session.upsert(&SimpleUpsertContext::new(key, key), key + 1),
            Status::Ok
        );
    }

    let mut iter = store.scan_in_memory();
    let mut count = 0u64;
    while let Some(record) = iter.get_next() {
        assert_eq!(*record.value(), *record.key());
        count += 1;
    }
    assert_eq!(count, 1000);
}

#[test]
fn empty_scan_returns_nothing() {
    let store = common::small_store(16);
    let mut iter = store.scan_in_memory();
    assert!(iter.get_next().is_none());
}

#[test]
fn addresses_increase_along_the_scan() {
    let store = common::small_store(64);
    let mut session = store.open_session();
    for key in 0u64..100 {
        session.upsert(&SimpleUpsertContext::new(key, key), key + 1);
    }
    let mut iter = store.scan_in_memory();
    let mut last = None;
    while let Some(record) = iter.get_next() {
        if let Some(previous) = last {
            assert!(record.address() > previous);
        }
        last = Some(record.address());
    }
}
