//! The hybrid log allocator.
//!
//! An append-only byte log split into fixed-size pages. The most recent
//! pages form the mutable region (in-place updates allowed), older resident
//! pages are read-only, and pages below the head address live only on the
//! device. Five anchors partition the address space:
//!
//! ```text
//! begin <= head <= safe_read_only <= read_only <= tail
//! ```
//!
//! All anchor advances are monotonic and scheduled through the epoch
//! manager, so no thread can observe memory being recycled under it.

mod flush;
mod page;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::address::{Address, AtomicAddress, AtomicPageOffset, PageOffset};
use crate::device::StorageDevice;
use crate::epoch::{current_thread_id, EpochManager};
use crate::status::Status;
use crate::utility::is_power_of_two;

use flush::FlushWorker;
use page::{PageSlot, PAGE_OPEN};

/// Hybrid log sizing.
#[derive(Debug, Clone)]
pub struct HybridLogConfig {
    /// Page size as a power of two; at most `Address::OFFSET_BITS`.
    pub page_size_bits: u32,
    /// Pages resident in memory (the ring capacity).
    pub memory_pages: u32,
    /// Trailing pages kept in the mutable region.
    pub mutable_pages: u32,
}

impl HybridLogConfig {
    /// Derive a configuration from a total in-memory byte budget.
    pub fn new(memory_bytes: u64, page_size_bits: u32, mutable_fraction: f64) -> Result<Self, Status> {
        if page_size_bits > Address::OFFSET_BITS || page_size_bits < 6 {
            return Err(Status::InvalidArgument);
        }
        let page_size = 1u64 << page_size_bits;
        if memory_bytes < 2 * page_size || !is_power_of_two(page_size) {
            return Err(Status::InvalidArgument);
        }
        if memory_bytes % page_size != 0 {
            return Err(Status::InvalidArgument);
        }
        let memory_pages = (memory_bytes / page_size) as u32;
        let mutable_pages = ((memory_pages as f64 * mutable_fraction) as u32)
            .clamp(1, memory_pages - 1);
        Ok(Self {
            page_size_bits,
            memory_pages,
            mutable_pages,
        })
    }
}

/// Anchor positions and region sizes, for introspection.
#[derive(Debug, Clone)]
pub struct LogStats {
    /// Earliest live address.
    pub begin_address: Address,
    /// Lowest resident address.
    pub head_address: Address,
    /// Below this, records are immutable and flushed.
    pub safe_read_only_address: Address,
    /// Below this, no in-place updates.
    pub read_only_address: Address,
    /// Next allocation position.
    pub tail_address: Address,
    /// Bytes in the mutable region.
    pub mutable_bytes: u64,
    /// Bytes resident in memory.
    pub resident_bytes: u64,
}

/// The hybrid log. Shared behind `Arc`; anchor-advancing operations
/// schedule their unsafe phases through the epoch manager.
pub struct HybridLog<D: StorageDevice> {
    this: Weak<Self>,
    config: HybridLogConfig,
    device: Arc<D>,
    epoch: Arc<EpochManager>,
    slots: Box<[PageSlot]>,
    tail: AtomicPageOffset,
    read_only: AtomicAddress,
    safe_read_only: AtomicAddress,
    head: AtomicAddress,
    begin: AtomicAddress,
    pub(crate) flushed_until: AtomicAddress,
    pub(crate) flush_failed: AtomicBool,
    flusher: FlushWorker,
}

impl<D: StorageDevice> HybridLog<D> {
    /// Create a log with all pages pre-allocated and zeroed.
    pub fn new(
        config: HybridLogConfig,
        device: Arc<D>,
        epoch: Arc<EpochManager>,
    ) -> Result<Arc<Self>, Status> {
        if config.memory_pages < 2 || config.mutable_pages >= config.memory_pages {
            return Err(Status::InvalidArgument);
        }
        let page_size = 1usize << config.page_size_bits;
        let mut slots = Vec::with_capacity(config.memory_pages as usize);
        for _ in 0..config.memory_pages {
            slots.push(PageSlot::new(page_size).ok_or(Status::OutOfMemory)?);
        }

        let log = Arc::new_cyclic(|weak| Self {
            this: weak.clone(),
            config,
            device,
            epoch,
            slots: slots.into_boxed_slice(),
            tail: AtomicPageOffset::from_address(Address::new(0, 0)),
            read_only: AtomicAddress::new(Address::new(0, 0)),
            safe_read_only: AtomicAddress::new(Address::new(0, 0)),
            head: AtomicAddress::new(Address::new(0, 0)),
            begin: AtomicAddress::new(Address::new(0, 0)),
            flushed_until: AtomicAddress::new(Address::new(0, 0)),
            flush_failed: AtomicBool::new(false),
            flusher: FlushWorker::spawn(weak.clone()),
        });
        Ok(log)
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        1usize << self.config.page_size_bits
    }

    /// Ring capacity in pages.
    #[inline]
    pub fn memory_pages(&self) -> u32 {
        self.config.memory_pages
    }

    /// The backing device.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub(crate) fn slot_for(&self, page: u32) -> &PageSlot {
        &self.slots[(page % self.config.memory_pages) as usize]
    }

    /// Next allocation address.
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.tail.load(Ordering::Acquire).to_address()
    }

    /// No in-place updates below this address.
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.read_only.load(Ordering::Acquire)
    }

    /// Immutable and flushed below this address.
    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only.load(Ordering::Acquire)
    }

    /// Lowest resident address.
    #[inline]
    pub fn head_address(&self) -> Address {
        self.head.load(Ordering::Acquire)
    }

    /// Earliest live address.
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin.load(Ordering::Acquire)
    }

    /// Everything below this has reached the device.
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until.load(Ordering::Acquire)
    }

    /// Whether `address` may be updated in place.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.read_only_address()
    }

    /// The written-offset watermark of `page`: the offset at which the page
    /// was closed, or the page size while it is still open.
    pub fn page_watermark(&self, page: u32) -> u32 {
        let closed_at = self.slot_for(page).closed_at();
        if closed_at == PAGE_OPEN {
            self.page_size() as u32
        } else {
            closed_at
        }
    }

    /// Reserve `num_bytes` (8-byte aligned) in the log and return the record
    /// address. Straddling reservations waste the end of the page and retry
    /// on the next one; the winning thread performs the page transition.
    pub fn allocate(&self, num_bytes: u32) -> Result<Address, Status> {
        debug_assert!(num_bytes % 8 == 0);
        let page_size = self.page_size() as u64;
        if num_bytes as u64 > page_size {
            return Err(Status::InvalidArgument);
        }
        loop {
            if self.flush_failed.load(Ordering::Acquire) {
                return Err(Status::IoError);
            }
            let before: PageOffset = self.tail.reserve(num_bytes);
            let end = before.offset() + num_bytes as u64;
            if end <= page_size {
                // The reservation fits, but the slot may still hold a page
                // awaiting eviction; no thread writes into it before the
                // head anchor has moved past the outgoing page.
                if before.page() >= self.config.memory_pages {
                    let min_head =
                        Address::new(before.page() - self.config.memory_pages + 1, 0);
                    if self.head_address() < min_head {
                        self.evict_until(min_head)?;
                    }
                }
                return Ok(Address::new(before.page(), before.offset() as u32));
            }

            // The reservation straddles the page end. Move the tail to the
            // next page; the CAS winner closes the old page and makes room.
            if before.page() >= Address::MAX_PAGE {
                return Err(Status::OutOfMemory);
            }
            let (advanced, won) = self.tail.new_page(before.page());
            if advanced && won {
                let watermark = before.offset().min(page_size) as u32;
                self.on_page_closed(before.page(), watermark);
            }
        }
    }

    /// Raw pointer to the bytes at `address`.
    ///
    /// # Safety
    /// `address` must be at or above the head address (and the caller must
    /// hold an epoch entry so it stays resident), or the address must point
    /// at an unpublished allocation owned by the caller.
    #[inline]
    pub unsafe fn get(&self, address: Address) -> *const u8 {
        debug_assert!(address.offset() < self.page_size() as u32);
        self.slot_for(address.page())
            .base_ptr()
            .add(address.offset() as usize) as *const u8
    }

    /// Mutable variant of [`HybridLog::get`].
    ///
    /// # Safety
    /// As for `get`; additionally the caller must have exclusive write
    /// rights to the bytes (a fresh reservation, or the generation lock for
    /// an in-place value update).
    #[inline]
    pub unsafe fn get_mut(&self, address: Address) -> *mut u8 {
        debug_assert!(address.offset() < self.page_size() as u32);
        self.slot_for(address.page())
            .base_ptr()
            .add(address.offset() as usize)
    }

    /// Page transition bookkeeping, run by the thread that won the tail CAS.
    fn on_page_closed(&self, closed_page: u32, watermark: u32) {
        self.slot_for(closed_page).close(watermark);

        // Keep only the configured number of trailing pages mutable.
        let next_page = closed_page + 1;
        if next_page > self.config.mutable_pages {
            let target = Address::new(next_page - self.config.mutable_pages, 0);
            self.shift_read_only(target);
        }
    }

    /// Raise the read-only anchor. Once every session refreshes past the
    /// epoch, the safe-read-only anchor follows and the covered pages are
    /// queued for flushing.
    pub fn shift_read_only(&self, target: Address) {
        let previous = self.read_only.load(Ordering::Acquire);
        if self.read_only.advance_to(target) == target && target > previous {
            let log = self.this.upgrade().expect("log handle alive");
            self.epoch.bump_epoch_with_action(move || {
                log.safe_read_only.advance_to(target);
                log.flusher.request_flush_to(target);
            });
        }
    }

    /// Raise the head anchor to `target` (clamped to the flushed frontier),
    /// recycling evicted ring slots once readers drain.
    pub fn shift_head(&self, target: Address) {
        let flushed = self.flushed_until.load(Ordering::Acquire);
        let target = target.min(flushed);
        let current = self.head.load(Ordering::Acquire);
        if target <= current {
            return;
        }
        let log = self.this.upgrade().expect("log handle alive");
        self.epoch.bump_epoch_with_action(move || {
            let old_head = log.head.load(Ordering::Acquire);
            // Recycle before publishing the new head: allocators spin on the
            // head anchor before touching a recycled slot.
            for page in old_head.page()..target.page() {
                log.slot_for(page).recycle();
            }
            log.head.advance_to(target);
        });
    }

    /// Truncate the log: raise the begin anchor (never past head). The
    /// caller is responsible for garbage-collecting index entries below the
    /// new begin address.
    pub fn shift_begin(&self, target: Address) -> Address {
        let clamped = target.min(self.head_address());
        self.begin.advance_to(clamped)
    }

    /// Force read_only/safe_read_only/flush/head forward until the head
    /// anchor reaches `min_head`, driving this thread's epoch so scheduled
    /// actions can run even single-threaded.
    fn evict_until(&self, min_head: Address) -> Result<(), Status> {
        self.shift_read_only(min_head);
        let thread_id = current_thread_id();
        loop {
            if self.flushed_until.load(Ordering::Acquire) >= min_head {
                break;
            }
            if self.flush_failed.load(Ordering::Acquire) {
                return Err(Status::IoError);
            }
            self.epoch.refresh(thread_id);
            std::thread::yield_now();
        }
        self.shift_head(min_head);
        while self.head.load(Ordering::Acquire) < min_head {
            self.epoch.refresh(thread_id);
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Copy a resident page's bytes into `out`. Used by checkpoint capture;
    /// the caller holds an epoch entry so the page cannot be recycled.
    pub(crate) fn copy_page_into(&self, page: u32, out: &mut [u8]) {
        let page_size = self.page_size();
        assert_eq!(out.len(), page_size);
        // SAFETY: the slot stays resident for the duration (epoch-protected)
        // and we only read bytes; concurrent record writes may race but a
        // checkpoint captures each page again after it is closed.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot_for(page).base_ptr() as *const u8,
                out.as_mut_ptr(),
                page_size,
            );
        }
    }

    /// Load raw page bytes into the ring and mark the page closed. Recovery
    /// only; runs before any session opens.
    pub(crate) fn load_page(&self, page: u32, bytes: &[u8]) {
        let page_size = self.page_size();
        assert_eq!(bytes.len(), page_size);
        let slot = self.slot_for(page);
        // SAFETY: recovery has exclusive access to the log.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.base_ptr(), page_size);
        }
        slot.close(page_size as u32);
    }

    /// Reopen the page holding the recovered tail so allocation can resume
    /// inside it.
    pub(crate) fn reopen_page(&self, page: u32) {
        self.slot_for(page).reopen();
    }

    /// Position the log at recovered anchors. Runs before any session
    /// opens; the restored pages have already been loaded into the ring.
    pub fn initialize_from_recovery(&self, begin: Address, head: Address, tail: Address) {
        self.begin.store(begin, Ordering::Release);
        self.head.store(head, Ordering::Release);
        // Recovered records are never updated in place; everything below
        // the restored tail is treated as immutable and flushed.
        self.read_only.store(tail, Ordering::Release);
        self.safe_read_only.store(tail, Ordering::Release);
        self.flushed_until.store(tail, Ordering::Release);
        self.tail.store_address(tail, Ordering::Release);
    }

    /// Snapshot the anchors.
    pub fn stats(&self) -> LogStats {
        let begin = self.begin_address();
        let head = self.head_address();
        let safe_read_only = self.safe_read_only_address();
        let read_only = self.read_only_address();
        let tail = self.tail_address();
        LogStats {
            begin_address: begin,
            head_address: head,
            safe_read_only_address: safe_read_only,
            read_only_address: read_only,
            tail_address: tail,
            mutable_bytes: tail - read_only,
            resident_bytes: tail - head,
        }
    }

    /// Stop the flush worker. Called on store shutdown.
    pub(crate) fn shutdown(&self) {
        self.flusher.shutdown();
    }
}
