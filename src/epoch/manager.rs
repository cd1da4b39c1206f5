//! The epoch manager: a per-thread epoch table plus a fixed drain list of
//! deferred actions.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;

/// Cache line size assumed for padding.
const CACHE_LINE_BYTES: usize = 64;

/// Maximum number of threads that may concurrently hold epoch entries.
pub const MAX_THREADS: usize = 96;

/// Epoch value published by a thread that is not inside a protected region.
pub const UNPROTECTED: u64 = 0;

/// Capacity of the deferred-action list.
const DRAIN_LIST_SIZE: usize = 256;

/// Stable per-thread slot index into the epoch table.
pub type ThreadId = usize;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<ThreadId>>> = OnceLock::new();

fn free_thread_ids() -> &'static Mutex<Vec<ThreadId>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

struct ThreadIdGuard {
    id: ThreadId,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        if let Some(free) = FREE_THREAD_IDS.get() {
            free.lock().push(self.id);
        }
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

/// Return this thread's stable slot index, allocating one on first use.
///
/// Slots are recycled when threads exit, so sequential thread churn does not
/// exhaust the table.
///
/// # Panics
/// Panics if more than [`MAX_THREADS`] threads concurrently use the engine;
/// that is a deployment error, not a recoverable condition.
pub fn current_thread_id() -> ThreadId {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return guard.id;
        }
        let id = allocate_thread_id();
        slot.replace(ThreadIdGuard { id });
        id
    })
}

fn allocate_thread_id() -> ThreadId {
    if let Some(id) = free_thread_ids().lock().pop() {
        return id;
    }
    match NEXT_THREAD_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
        (next < MAX_THREADS).then_some(next + 1)
    }) {
        Ok(id) => id,
        // A racing thread may have just returned an id; re-check once.
        Err(_) => free_thread_ids()
            .lock()
            .pop()
            .unwrap_or_else(|| panic!("more than {MAX_THREADS} concurrent engine threads")),
    }
}

/// One cache-line-padded slot of the epoch table.
#[repr(C, align(64))]
struct Entry {
    /// Epoch last observed by the owning thread; `UNPROTECTED` outside
    /// protected regions. Written only by the owner, read by everyone.
    local_epoch: AtomicU64,
    /// Nesting depth for reentrant protection (sessions holding a scan
    /// iterator, for example).
    reentrant: AtomicU32,
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

/// A deferred action slot in the drain list.
struct DrainSlot {
    /// Epoch the action waits on; `FREE` / `LOCKED` are sentinels.
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl DrainSlot {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Claim and run the action if its trigger epoch matches `expected`.
    fn try_pop(&self, expected: u64) -> bool {
        if self
            .epoch
            .compare_exchange(expected, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED sentinel gives us exclusive slot access.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    /// Install `callback` to run once `trigger_epoch` is safe. Fails (hands
    /// the callback back) if the slot was claimed concurrently.
    fn try_push<F>(&self, trigger_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: the LOCKED sentinel gives us exclusive slot access.
        unsafe { *self.callback.get() = Some(Box::new(callback)) };
        self.epoch.store(trigger_epoch, Ordering::Release);
        Ok(())
    }
}

// SAFETY: slot contents are only touched under the LOCKED sentinel.
unsafe impl Send for DrainSlot {}
unsafe impl Sync for DrainSlot {}

/// Epoch manager (one per engine).
pub struct EpochManager {
    table: Box<[Entry]>,
    drain_list: Box<[DrainSlot]>,
    drain_count: AtomicU32,
    /// The global epoch.
    current_epoch: AtomicU64,
    /// Highest epoch every protected thread has moved past.
    safe_epoch: AtomicU64,
}

impl EpochManager {
    /// Create a manager with an empty drain list.
    pub fn new() -> Self {
        Self {
            table: (0..MAX_THREADS).map(|_| Entry::new()).collect(),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| DrainSlot::new()).collect(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_epoch: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Publish the current epoch for `thread_id`, entering the protected
    /// region. Returns the published epoch.
    #[inline]
    pub fn protect(&self, thread_id: ThreadId) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[thread_id].local_epoch.store(epoch, Ordering::Release);
        epoch
    }

    /// Re-publish the current epoch and run any drain actions that became
    /// safe. This is the periodic safe point every session passes through.
    #[inline]
    pub fn refresh(&self, thread_id: ThreadId) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Leave the protected region.
    #[inline]
    pub fn unprotect(&self, thread_id: ThreadId) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Nested protect: only the outermost call publishes an epoch.
    pub fn reentrant_protect(&self, thread_id: ThreadId) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            entry.local_epoch.store(epoch, Ordering::Release);
            epoch
        } else {
            entry.local_epoch.load(Ordering::Acquire)
        }
    }

    /// Nested unprotect paired with [`EpochManager::reentrant_protect`].
    pub fn reentrant_unprotect(&self, thread_id: ThreadId) {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            entry.local_epoch.store(UNPROTECTED, Ordering::Release);
        }
    }

    /// Whether `thread_id` currently holds an epoch entry.
    #[inline]
    pub fn is_protected(&self, thread_id: ThreadId) -> bool {
        self.table[thread_id].local_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    /// Bump the global epoch.
    pub fn bump_epoch(&self) -> u64 {
        let next = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next);
        }
        next
    }

    /// Bump the global epoch to `E` and register `action` to run exactly
    /// once, on the first thread that observes all active entries at `>= E`.
    ///
    /// Returns the new epoch.
    pub fn bump_epoch_with_action<F>(&self, action: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let trigger_epoch = self.bump_epoch() - 1;
        let mut action = Some(action);
        let mut slot_index = 0;
        let mut full_scans = 0;
        loop {
            let slot = &self.drain_list[slot_index];
            if slot.epoch.load(Ordering::Acquire) == DrainSlot::FREE {
                match slot.try_push(trigger_epoch, action.take().expect("action present")) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        // The action may already be safe; give it a chance
                        // to run without waiting for the next refresh.
                        self.drain(trigger_epoch + 1);
                        return trigger_epoch + 1;
                    }
                    Err(returned) => action = Some(returned),
                }
            }
            slot_index = (slot_index + 1) % DRAIN_LIST_SIZE;
            if slot_index == 0 {
                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    tracing::warn!("drain list saturated; waiting for a free slot inline");
                    self.spin_until_safe(trigger_epoch);
                    if let Some(cb) = action.take() {
                        cb();
                    }
                    return trigger_epoch + 1;
                }
                thread::yield_now();
            }
        }
    }

    /// Recompute the safe epoch and run every drain action at or below it.
    fn drain(&self, current_epoch: u64) {
        let safe = self.compute_safe_epoch(current_epoch);
        for slot in self.drain_list.iter() {
            let trigger = slot.epoch.load(Ordering::Acquire);
            if trigger == DrainSlot::FREE || trigger == DrainSlot::LOCKED || trigger > safe {
                continue;
            }
            if slot.try_pop(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Scan the table and update the cached safe epoch: one less than the
    /// oldest epoch still held by a protected thread.
    pub fn compute_safe_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest = current_epoch;
        for entry in self.table.iter() {
            let epoch = entry.local_epoch.load(Ordering::Acquire);
            if epoch != UNPROTECTED && epoch < oldest {
                oldest = epoch;
            }
        }
        let safe = oldest.saturating_sub(1);
        self.safe_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Whether every thread has drained past `epoch`.
    #[inline]
    pub fn is_safe(&self, epoch: u64) -> bool {
        epoch <= self.safe_epoch.load(Ordering::Acquire)
    }

    /// Spin (yielding) until `epoch` is safe. Used only on slow paths where
    /// the caller cannot make progress otherwise.
    pub fn spin_until_safe(&self, epoch: u64) {
        loop {
            let current = self.current_epoch.load(Ordering::Acquire);
            if self.compute_safe_epoch(current) >= epoch {
                return;
            }
            thread::yield_now();
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for reentrant epoch protection.
pub struct EpochGuard {
    epoch: Arc<EpochManager>,
    thread_id: ThreadId,
}

impl EpochGuard {
    /// Protect the calling thread until the guard drops.
    pub fn new(epoch: Arc<EpochManager>) -> Self {
        let thread_id = current_thread_id();
        epoch.reentrant_protect(thread_id);
        Self { epoch, thread_id }
    }

    /// The guarded thread's slot index.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn protect_unprotect() {
        let epoch = EpochManager::new();
        assert!(!epoch.is_protected(0));
        let e = epoch.protect(0);
        assert_eq!(e, 1);
        assert!(epoch.is_protected(0));
        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn safe_epoch_tracks_slowest_thread() {
        let epoch = EpochManager::new();
        epoch.current_epoch.store(5, Ordering::Relaxed);
        epoch.protect(0);

        epoch.compute_safe_epoch(10);
        assert!(epoch.is_safe(4));
        assert!(!epoch.is_safe(5));

        epoch.unprotect(0);
        epoch.compute_safe_epoch(10);
        assert!(epoch.is_safe(9));
    }

    #[test]
    fn action_runs_once_all_threads_drain() {
        let epoch = Arc::new(EpochManager::new());
        let fired = Arc::new(AtomicBool::new(false));

        epoch.protect(0);
        let fired_clone = fired.clone();
        epoch.bump_epoch_with_action(move || {
            fired_clone.store(true, Ordering::Release);
        });
        // Thread 0 still pinned at the old epoch.
        assert!(!fired.load(Ordering::Acquire));

        epoch.refresh(0);
        assert!(fired.load(Ordering::Acquire));
        epoch.unprotect(0);
    }

    #[test]
    fn action_runs_immediately_when_no_thread_is_protected() {
        let epoch = Arc::new(EpochManager::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        epoch.bump_epoch_with_action(move || {
            fired_clone.store(true, Ordering::Release);
        });
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn reentrant_protection_nests() {
        let epoch = EpochManager::new();
        epoch.reentrant_protect(1);
        epoch.reentrant_protect(1);
        epoch.reentrant_unprotect(1);
        assert!(epoch.is_protected(1));
        epoch.reentrant_unprotect(1);
        assert!(!epoch.is_protected(1));
    }

    #[test]
    fn thread_ids_recycle_under_churn() {
        for _ in 0..(MAX_THREADS * 2) {
            thread::spawn(|| {
                let id = current_thread_id();
                assert!(id < MAX_THREADS);
            })
            .join()
            .unwrap();
        }
    }
}
