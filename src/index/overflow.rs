//! Overflow bucket pool.
//!
//! Buckets that fill their seven slots chain into boxed overflow buckets.
//! Each overflow bucket is its own heap allocation, so pointers stay stable
//! while the registry vector grows; links store 1-based pool indices, never
//! raw pointers, which keeps the checkpoint image position-independent.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;

use super::bucket::{HashBucket, OverflowEntry};

pub(super) struct OverflowPool {
    buckets: RwLock<Vec<*mut HashBucket>>,
    free_list: Mutex<Vec<OverflowEntry>>,
}

impl OverflowPool {
    pub(super) fn new() -> Self {
        Self {
            buckets: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a fresh (or recycled, reset) overflow bucket. Returns the
    /// link and a stable pointer to the bucket.
    pub(super) fn allocate(&self) -> (OverflowEntry, *const HashBucket) {
        if let Some(link) = self.free_list.lock().pop() {
            if let Some(ptr) = self.bucket_ptr(link) {
                // SAFETY: the pool owns the bucket; a free-listed bucket is
                // unlinked so we have exclusive use of it.
                unsafe { (*ptr).reset() };
                return (link, ptr);
            }
        }

        let boxed = Box::into_raw(Box::new(HashBucket::new()));
        let mut buckets = self.buckets.write();
        let index = buckets.len() as u64;
        buckets.push(boxed);
        (OverflowEntry::new(index), boxed as *const HashBucket)
    }

    /// Return a bucket that lost its install CAS and was never linked.
    pub(super) fn deallocate(&self, link: OverflowEntry) {
        if link.is_none() {
            return;
        }
        self.free_list.lock().push(link);
    }

    /// Resolve a link to a stable bucket pointer.
    pub(super) fn bucket_ptr(&self, link: OverflowEntry) -> Option<*const HashBucket> {
        if link.is_none() {
            return None;
        }
        self.buckets
            .read()
            .get(link.index() as usize)
            .copied()
            .map(|p| p as *const HashBucket)
    }

    /// Number of buckets ever allocated (live + free-listed).
    pub(super) fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Drop every bucket. Requires `&mut self`, so no reader can hold a
    /// pointer into the pool.
    pub(super) fn clear(&mut self) {
        self.free_list.get_mut().clear();
        for ptr in self.buckets.get_mut().drain(..) {
            // SAFETY: ptr came from Box::into_raw and is freed exactly once.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }

    /// Snapshot every bucket's raw contents for checkpointing: for each pool
    /// slot, seven entry words plus the overflow link word.
    pub(super) fn snapshot(&self) -> Vec<[u64; HashBucket::NUM_ENTRIES + 1]> {
        let buckets = self.buckets.read();
        buckets
            .iter()
            .map(|&ptr| {
                // SAFETY: pool-owned bucket; entries are atomics.
                let bucket = unsafe { &*ptr };
                let mut words = [0u64; HashBucket::NUM_ENTRIES + 1];
                for (i, entry) in bucket.entries.iter().enumerate() {
                    words[i] = entry.load(Ordering::Acquire).control();
                }
                words[HashBucket::NUM_ENTRIES] = bucket.overflow.load(Ordering::Acquire).control();
                words
            })
            .collect()
    }

    /// Rebuild the pool from a checkpoint snapshot.
    pub(super) fn restore(&mut self, snapshot: &[[u64; HashBucket::NUM_ENTRIES + 1]]) {
        self.clear();
        let buckets = self.buckets.get_mut();
        for words in snapshot {
            let bucket = HashBucket::new();
            for (i, entry) in bucket.entries.iter().enumerate() {
                entry.store(
                    super::bucket::HashBucketEntry::from_control(words[i]),
                    Ordering::Release,
                );
            }
            bucket
                .overflow
                .store(OverflowEntry::from_control(words[HashBucket::NUM_ENTRIES]), Ordering::Release);
            buckets.push(Box::into_raw(Box::new(bucket)));
        }
    }
}

impl Drop for OverflowPool {
    fn drop(&mut self) {
        self.clear();
    }
}

// SAFETY: bucket contents are atomics; the registry is guarded by the RwLock
// and bucket allocations are stable until `clear`, which requires &mut.
unsafe impl Send for OverflowPool {}
unsafe impl Sync for OverflowPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_resolves_to_stable_pointer() {
        let pool = OverflowPool::new();
        let (link, ptr) = pool.allocate();
        assert!(!link.is_none());
        assert_eq!(pool.bucket_ptr(link), Some(ptr));
    }

    #[test]
    fn deallocated_buckets_are_reused() {
        let pool = OverflowPool::new();
        let (a, _) = pool.allocate();
        let (b, _) = pool.allocate();
        assert_ne!(a, b);
        pool.deallocate(b);
        let (c, _) = pool.allocate();
        assert_eq!(c, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut pool = OverflowPool::new();
        let (link, ptr) = pool.allocate();
        // SAFETY: freshly allocated, unlinked bucket.
        let bucket = unsafe { &*ptr };
        bucket.entries[3].store(
            super::super::bucket::HashBucketEntry::from_control(0xDEAD),
            Ordering::Release,
        );

        let snapshot = pool.snapshot();
        let mut restored = OverflowPool::new();
        restored.restore(&snapshot);
        let ptr = restored.bucket_ptr(link).unwrap();
        // SAFETY: restored pool owns the bucket.
        let bucket = unsafe { &*ptr };
        assert_eq!(bucket.entries[3].load(Ordering::Acquire).control(), 0xDEAD);
    }
}
