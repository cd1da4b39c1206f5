//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tidekv::{NullDevice, TideKv, TideKvConfig};

/// A small in-memory store: 4 KiB pages, 1 MiB of log, no checkpointing.
pub fn small_store(table_size: u64) -> Arc<TideKv<u64, u64, NullDevice>> {
    let config = TideKvConfig::new(table_size, 1 << 20)
        .with_page_size_bits(12)
        .with_mutable_fraction(0.5);
    TideKv::open(config, NullDevice::new()).expect("open store")
}

/// A store over generation-locked counters, for in-place update tests.
pub fn counter_store(
    table_size: u64,
) -> Arc<TideKv<u64, tidekv::GenLocked<u64>, NullDevice>> {
    let config = TideKvConfig::new(table_size, 1 << 20)
        .with_page_size_bits(12)
        .with_mutable_fraction(0.5);
    TideKv::open(config, NullDevice::new()).expect("open store")
}
