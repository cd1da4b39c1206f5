//! Randomized operation sequences checked against a model map.

mod common;

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidekv::{
    AddContext, SimpleDeleteContext, SimpleReadContext, SimpleUpsertContext, Status,
};

#[test]
fn random_ops_match_model() {
    let mut rng = StdRng::seed_from_u64(0x7DE1);
    let store = common::small_store(64);
    let mut session = store.open_session();
    let mut model: HashMap<u64, u64> = HashMap::new();

    for serial in 1..=20_000u64 {
        let key = rng.gen_range(0..200u64);
        match rng.gen_range(0..10u32) {
            0..=4 => {
                let value = rng.gen::<u32>() as u64;
                assert_eq!(
                    session.upsert(&SimpleUpsertContext::new(key, value), serial),
                    Status::Ok
                );
                model.insert(key, value);
            }
            5..=6 => {
                let delta = rng.gen_range(1..100u64);
                assert_eq!(session.rmw(&AddContext::new(key, delta), serial), Status::Ok);
                match model.get_mut(&key) {
                    Some(value) => *value = value.wrapping_add(delta),
                    None => {
                        model.insert(key, delta);
                    }
                }
            }
            7 => {
                assert_eq!(session.delete(&SimpleDeleteContext::new(key), serial), Status::Ok);
                model.remove(&key);
            }
            _ => {
                let mut ctx = SimpleReadContext::new(key);
                let status = session.read(&mut ctx, serial);
                match model.get(&key) {
                    Some(&value) => {
                        assert_eq!(status, Status::Ok);
                        assert_eq!(ctx.value(), Some(value));
                    }
                    None => assert_eq!(status, Status::NotFound),
                }
            }
        }
        if serial % 1024 == 0 {
            session.refresh();
        }
    }

    let mut serial = 20_000u64;
    for (key, value) in &model {
        serial += 1;
        let mut ctx = SimpleReadContext::new(*key);
        assert_eq!(session.read(&mut ctx, serial), Status::Ok);
        assert_eq!(ctx.value(), Some(*value), "key {key}");
    }
}
