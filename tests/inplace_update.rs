//! In-place updates versus copy-on-update across the read-only boundary.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use tidekv::{GenLocked, ReadContext, Status, UpsertContext};

/// Upsert context over generation-locked counters.
#[derive(Clone)]
struct PutCounter {
    key: u64,
    value: u64,
}

impl UpsertContext<u64, GenLocked<u64>> for PutCounter {
    fn key(&self) -> &u64 {
        &self.key
    }

    fn put(&self, dest: &mut GenLocked<u64>) {
        *dest.get_mut() = self.value;
    }
}

/// Read context over generation-locked counters.
#[derive(Clone)]
struct GetCounter {
    key: u64,
    result: Arc<Mutex<Option<u64>>>,
}

impl GetCounter {
    fn new(key: u64) -> Self {
        Self {
            key,
            result: Arc::new(Mutex::new(None)),
        }
    }

    fn value(&self) -> Option<u64> {
        *self.result.lock()
    }
}

impl ReadContext<u64, GenLocked<u64>> for GetCounter {
    fn key(&self) -> &u64 {
        &self.key
    }

    fn get(&mut self, value: &GenLocked<u64>) {
        *self.result.lock() = Some(*value.get());
    }
}

#[test]
fn second_upsert_updates_in_place() {
    let store = common::counter_store(64);
    let mut session = store.open_session();

    assert_eq!(session.upsert(&PutCounter { key: 1, value: 10 }, 1), Status::Ok);
    let tail_after_insert = store.log_stats().tail_address;

    // Still in the mutable region: the upsert overwrites the record.
    assert_eq!(session.upsert(&PutCounter { key: 1, value: 20 }, 2), Status::Ok);
    assert_eq!(store.log_stats().tail_address, tail_after_insert);

    let mut ctx = GetCounter::new(1);
    assert_eq!(session.read(&mut ctx, 3), Status::Ok);
    assert_eq!(ctx.value(), Some(20));
}

#[test]
fn upsert_past_read_only_appends() {
    let store = common::counter_store(64);
    let mut session = store.open_session();

    assert_eq!(session.upsert(&PutCounter { key: 1, value: 10 }, 1), Status::Ok);
    store.shift_read_only_to_tail();
    session.refresh();
    let tail_before = store.log_stats().tail_address;

    // The record is frozen; the same-size upsert must produce a new record
    // at a strictly greater address.
    assert_eq!(session.upsert(&PutCounter { key: 1, value: 20 }, 2), Status::Ok);
    assert!(store.log_stats().tail_address > tail_before);

    let mut ctx = GetCounter::new(1);
    assert_eq!(session.read(&mut ctx, 3), Status::Ok);
    assert_eq!(ctx.value(), Some(20));
}

#[test]
fn plain_values_always_append() {
    // u64 values carry no generation lock, so even mutable-region upserts
    // take the append path.
    let store = common::small_store(64);
    let mut session = store.open_session();

    assert_eq!(
        session.upsert(&tidekv::SimpleUpsertContext::new(1, 10u64), 1),
        Status::Ok
    );
    let tail = store.log_stats().tail_address;
    assert_eq!(
        session.upsert(&tidekv::SimpleUpsertContext::new(1, 20u64), 2),
        Status::Ok
    );
    assert!(store.log_stats().tail_address > tail);
}

#[test]
fn generation_bumps_on_each_in_place_update() {
    let store = common::counter_store(64);
    let mut session = store.open_session();

    session.upsert(&PutCounter { key: 7, value: 0 }, 1);
    let tail = store.log_stats().tail_address;
    for i in 0..50u64 {
        assert_eq!(
            session.upsert(&PutCounter { key: 7, value: i }, i + 2),
            Status::Ok
        );
    }
    // Every update was in place.
    assert_eq!(store.log_stats().tail_address, tail);

    let mut ctx = GetCounter::new(7);
    assert_eq!(session.read(&mut ctx, 100), Status::Ok);
    assert_eq!(ctx.value(), Some(49));
}

#[test]
fn rmw_uses_copy_path_after_freeze() {
    let store = common::counter_store(64);
    let mut session = store.open_session();

    assert_eq!(session.rmw(&tidekv::IncrementContext::new(3, 5), 1), Status::Ok);
    store.shift_read_only_to_tail();
    session.refresh();
    let tail = store.log_stats().tail_address;

    assert_eq!(session.rmw(&tidekv::IncrementContext::new(3, 5), 2), Status::Ok);
    assert!(store.log_stats().tail_address > tail);

    let mut ctx = GetCounter::new(3);
    assert_eq!(session.read(&mut ctx, 3), Status::Ok);
    assert_eq!(ctx.value(), Some(10));
}

#[test]
fn frozen_device_is_not_required_for_reads() {
    // Records between safe-read-only and tail are served from memory even
    // after the freeze (NullDevice would return zeros if we went to disk).
    let store = common::counter_store(64);
    let mut session = store.open_session();
    session.upsert(&PutCounter { key: 2, value: 77 }, 1);
    store.shift_read_only_to_tail();
    session.refresh();

    let mut ctx = GetCounter::new(2);
    assert_eq!(session.read(&mut ctx, 2), Status::Ok);
    assert_eq!(ctx.value(), Some(77));
}
