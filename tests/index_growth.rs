//! Index doubling under load.

mod common;

use tidekv::{SimpleReadContext, SimpleUpsertContext, Status};

#[test]
fn grow_preserves_all_keys() {
    let store = common::small_store(16);
    let mut session = store.open_session();

    let mut serial = 0u64;
    for key in 0u64..256 {
        serial += 1;
        assert_eq!(
            session.upsert(&SimpleUpsertContext::new(key, key), serial),
            Status::Ok
        );
    }
    for key in 0u64..256 {
        serial += 1;
        let mut ctx = SimpleReadContext::new(key);
        assert_eq!(session.read(&mut ctx, serial), Status::Ok);
        assert_eq!(ctx.value(), Some(key));
    }

    assert_eq!(store.index_stats().table_size, 16);
    assert!(store.grow_index());
    assert_eq!(store.index_stats().table_size, 32);

    for key in 0u64..256 {
        serial += 1;
        let mut ctx = SimpleReadContext::new(key);
        assert_eq!(session.read(&mut ctx, serial), Status::Ok, "key {key} after grow");
        assert_eq!(ctx.value(), Some(key));
    }
}

#[test]
fn grow_twice() {
    let store = common::small_store(8);
    let mut session = store.open_session();

    for key in 0u64..64 {
        session.upsert(&SimpleUpsertContext::new(key, key * 3), key + 1);
    }
    assert!(store.grow_index());
    assert!(store.grow_index());
    assert_eq!(store.index_stats().table_size, 32);

    let mut serial = 1000u64;
    for key in 0u64..64 {
        serial += 1;
        let mut ctx = SimpleReadContext::new(key);
        assert_eq!(session.read(&mut ctx, serial), Status::Ok);
        assert_eq!(ctx.value(), Some(key * 3));
    }
}

#[test]
fn writes_after_grow_land_in_new_table() {
    let store = common::small_store(8);
    let mut session = store.open_session();

    for key in 0u64..32 {
        session.upsert(&SimpleUpsertContext::new(key, key), key + 1);
    }
    assert!(store.grow_index());

    let mut serial = 100u64;
    for key in 32u64..64 {
        serial += 1;
        assert_eq!(
            session.upsert(&SimpleUpsertContext::new(key, key), serial),
            Status::Ok
        );
    }
    for key in 0u64..64 {
        serial += 1;
        let mut ctx = SimpleReadContext::new(key);
        assert_eq!(session.read(&mut ctx, serial), Status::Ok);
        assert_eq!(ctx.value(), Some(key));
    }
}
