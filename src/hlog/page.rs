//! Resident page slots.
//!
//! The log keeps a ring of `k` page buffers; page `p` lives in slot
//! `p % k`. A slot is recycled (zeroed) when its old page falls below the
//! head address, which the epoch manager guarantees happens only after every
//! reader that could dereference the old page has drained.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::utility::AlignedBuffer;

/// Watermark value for a page that has not been closed yet.
pub(crate) const PAGE_OPEN: u32 = u32::MAX;

pub(crate) struct PageSlot {
    buffer: UnsafeCell<AlignedBuffer>,
    /// Bytes written before the resident page was closed; `PAGE_OPEN` while
    /// the page is still accepting allocations. An upper bound: the bytes
    /// between the last record and the watermark are zero.
    closed_at: AtomicU32,
}

// SAFETY: buffer bytes are only written through exclusive reservations
// (allocate hands out disjoint ranges) and read under epoch protection.
unsafe impl Send for PageSlot {}
unsafe impl Sync for PageSlot {}

impl PageSlot {
    pub(crate) fn new(page_size: usize) -> Option<Self> {
        Some(Self {
            buffer: UnsafeCell::new(AlignedBuffer::zeroed(page_size, page_size)?),
            closed_at: AtomicU32::new(PAGE_OPEN),
        })
    }

    /// Base pointer of the page buffer.
    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        // SAFETY: pointer arithmetic only; aliasing is governed by the
        // reservation/epoch discipline described on the struct.
        unsafe { (*self.buffer.get()).as_mut_ptr() }
    }

    /// The page's written-offset watermark.
    #[inline]
    pub(crate) fn closed_at(&self) -> u32 {
        self.closed_at.load(Ordering::Acquire)
    }

    /// Record the watermark when the page stops accepting allocations.
    #[inline]
    pub(crate) fn close(&self, watermark: u32) {
        self.closed_at.store(watermark, Ordering::Release);
    }

    /// Reopen the slot without clearing it (recovery positions the tail in
    /// a partially filled page).
    pub(crate) fn reopen(&self) {
        self.closed_at.store(PAGE_OPEN, Ordering::Release);
    }

    /// Zero the buffer and reopen the slot for an incoming page.
    pub(crate) fn recycle(&self) {
        // SAFETY: called only from the head-advance drain action, after all
        // readers of the outgoing page have drained and before the incoming
        // page is opened for allocation.
        unsafe { (*self.buffer.get()).clear() };
        self.closed_at.store(PAGE_OPEN, Ordering::Release);
    }
}
