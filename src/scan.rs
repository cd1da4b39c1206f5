//! In-memory log scan iterator.
//!
//! Walks the live records between two addresses of the resident log. The
//! iterator holds an epoch entry for its whole lifetime, so the records it
//! hands out cannot be reclaimed while it is alive; they may, however, have
//! been logically superseded by later records.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::epoch::{EpochGuard, EpochManager};
use crate::hlog::HybridLog;
use crate::record::{Key, Record, Value};

/// One record produced by the scan; the borrows live as long as the
/// iterator.
pub struct ScanRecord<'a, K, V> {
    address: Address,
    key: &'a K,
    value: &'a V,
}

impl<K, V> ScanRecord<'_, K, V> {
    /// Log address of the record.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The record's key.
    pub fn key(&self) -> &K {
        self.key
    }

    /// The record's value.
    pub fn value(&self) -> &V {
        self.value
    }
}

/// Iterator over `[begin_scan, end_scan)` in the resident log.
pub struct LogScanIterator<K: Key, V: Value, D: StorageDevice> {
    hlog: Arc<HybridLog<D>>,
    cursor: Address,
    end: Address,
    _guard: EpochGuard,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: Key, V: Value, D: StorageDevice> LogScanIterator<K, V, D> {
    pub(crate) fn new(
        hlog: Arc<HybridLog<D>>,
        epoch: Arc<EpochManager>,
        begin_scan: Address,
        end_scan: Address,
    ) -> Self {
        let head = hlog.head_address();
        assert!(
            begin_scan >= head && end_scan >= head,
            "scan bounds must be at or above the head address"
        );
        let guard = EpochGuard::new(epoch);
        Self {
            hlog,
            cursor: begin_scan,
            end: end_scan,
            _guard: guard,
            _marker: PhantomData,
        }
    }

    /// Produce the next live record, skipping invalid and tombstone
    /// records, or `None` at the end of the range.
    ///
    /// # Panics
    /// Panics if the cursor has fallen below the head address, which means
    /// the iterator outlived the resident window it was created for.
    pub fn get_next(&mut self) -> Option<ScanRecord<'_, K, V>> {
        let record_size = Record::<K, V>::record_size();
        loop {
            if self.cursor >= self.end {
                return None;
            }
            assert!(
                self.cursor >= self.hlog.head_address(),
                "scan cursor fell below the head address"
            );

            let page = self.cursor.page();
            let watermark = self.hlog.page_watermark(page);
            if self.cursor.offset() + record_size > watermark {
                // Rest of the page was wasted by a straddling allocation.
                self.cursor = Address::new(page + 1, 0);
                continue;
            }

            // SAFETY: the cursor is resident (asserted above) and the epoch
            // guard keeps the page alive.
            let record = unsafe { Record::<K, V>::from_ptr(self.hlog.get(self.cursor)) };
            if record.header.is_null() {
                // Unwritten tail of the page.
                self.cursor = Address::new(page + 1, 0);
                continue;
            }

            let address = self.cursor;
            self.cursor = address + record_size as u64;
            if record.header.is_invalid() || record.header.is_tombstone() {
                continue;
            }
            // SAFETY: a non-null header means the record was fully written
            // (the header is stored last).
            return Some(ScanRecord {
                address,
                key: unsafe { record.key() },
                value: unsafe { record.value() },
            });
        }
    }

    /// The exclusive upper bound of the scan.
    pub fn end_address(&self) -> Address {
        self.end
    }
}
