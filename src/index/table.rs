//! The flat bucket array backing one version of the hash index.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;
use std::ptr::NonNull;

use super::bucket::HashBucket;
use super::KeyHash;
use crate::utility::is_power_of_two;

/// A power-of-two-sized array of cache-line buckets, allocated zeroed so
/// every slot starts in the free state.
pub struct BucketArray {
    buckets: Option<NonNull<HashBucket>>,
    size: u64,
}

impl BucketArray {
    /// An empty, unallocated array.
    pub const fn new() -> Self {
        Self {
            buckets: None,
            size: 0,
        }
    }

    /// Allocate (or clear) the array at `size` buckets.
    ///
    /// # Panics
    /// Panics if `size` is not a power of two; the engine validates sizes at
    /// configuration time, so hitting this is a programmer error.
    pub fn initialize(&mut self, size: u64) -> bool {
        assert!(is_power_of_two(size), "bucket count must be a power of two");
        assert!(size <= i32::MAX as u64, "bucket count too large");

        if self.size == size {
            if let Some(ptr) = self.buckets {
                // SAFETY: ptr covers `size` buckets owned by this array.
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size as usize) };
                return true;
            }
        }

        self.release();
        let layout = Self::layout(size);
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr as *mut HashBucket) {
            Some(ptr) => {
                self.buckets = Some(ptr);
                self.size = size;
                true
            }
            None => false,
        }
    }

    fn layout(size: u64) -> Layout {
        Layout::from_size_align(
            size as usize * mem::size_of::<HashBucket>(),
            mem::align_of::<HashBucket>(),
        )
        .expect("bucket array layout")
    }

    /// Free the array.
    pub fn release(&mut self) {
        if let Some(ptr) = self.buckets.take() {
            let layout = Self::layout(self.size);
            // SAFETY: allocated with the same layout in `initialize`.
            unsafe { dealloc(ptr.as_ptr() as *mut u8, layout) };
        }
        self.size = 0;
    }

    /// Number of buckets, zero if unallocated.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the array has been allocated.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.buckets.is_some()
    }

    /// The bucket selected by `hash`.
    #[inline]
    pub fn bucket(&self, hash: KeyHash) -> &HashBucket {
        self.bucket_at(hash.bucket_index(self.size) as u64)
    }

    /// The bucket at a raw index.
    #[inline]
    pub fn bucket_at(&self, index: u64) -> &HashBucket {
        debug_assert!(index < self.size);
        let ptr = self.buckets.expect("bucket array initialized");
        // SAFETY: index < size and the array is live.
        unsafe { &*ptr.as_ptr().add(index as usize) }
    }
}

impl Default for BucketArray {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BucketArray {
    fn drop(&mut self) {
        self.release();
    }
}

// SAFETY: buckets contain only atomics; the array itself is append-only
// between initialize/release which require &mut.
unsafe impl Send for BucketArray {}
unsafe impl Sync for BucketArray {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::index::HashBucketEntry;
    use std::sync::atomic::Ordering;

    #[test]
    fn initialize_and_clear() {
        let mut table = BucketArray::new();
        assert!(!table.is_initialized());
        assert!(table.initialize(64));
        assert!(table.is_initialized());
        assert_eq!(table.size(), 64);

        let bucket = table.bucket_at(0);
        bucket.entries[0].store(
            HashBucketEntry::new(Address::new(1, 8), 3, false),
            Ordering::Release,
        );

        // Re-initializing at the same size zeroes the slots.
        assert!(table.initialize(64));
        assert!(table.bucket_at(0).entries[0].load(Ordering::Acquire).is_unused());
    }

    #[test]
    fn buckets_start_free() {
        let mut table = BucketArray::new();
        table.initialize(16);
        for i in 0..16 {
            let bucket = table.bucket_at(i);
            for entry in &bucket.entries {
                assert!(entry.load(Ordering::Acquire).is_unused());
            }
            assert!(bucket.overflow.load(Ordering::Acquire).is_none());
        }
    }

    #[test]
    #[should_panic]
    fn rejects_non_power_of_two() {
        let mut table = BucketArray::new();
        table.initialize(100);
    }
}
