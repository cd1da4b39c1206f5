//! The operation engine.
//!
//! `TideKv` threads Upsert/Read/RMW/Delete through the hash index and the
//! hybrid log: look the key up, walk its record chain, update in place when
//! the record sits in the mutable region (under the value's generation
//! lock), otherwise append a new record and CAS the bucket entry over. A
//! lost CAS restarts the operation from the lookup; a chain that descends
//! below the head address turns the operation into a pending one.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    self, Action, AtomicSystemState, CheckpointToken, IndexMetadata, LogMetadata, LogPages, Phase,
    RecoveryResult, SessionSnapshot, SystemState,
};
use crate::config::TideKvConfig;
use crate::device::StorageDevice;
use crate::epoch::{current_thread_id, EpochManager};
use crate::hlog::{HybridLog, HybridLogConfig, LogStats};
use crate::index::{HashIndex, IndexStats, KeyHash};
use crate::record::{AtomicGenLock, Key, Record, RecordHeader, TryLock, Value};
use crate::scan::LogScanIterator;
use crate::status::Status;

use super::contexts::{DeleteContext, ReadContext, RmwContext, UpsertContext};
use super::pending::{PageInManager, PendingKind, PendingOp, RecordBuf};
use super::session::Session;

/// Outcome of one internal operation attempt.
pub(crate) enum OpResult {
    Done(Status),
    /// The chain descended below head at `address`; go pending.
    GoAsync { address: Address },
}

/// How a pending operation resolved against paged-in record bytes.
pub(crate) enum PendingOutcome {
    Completed(Status),
    /// The chain continues on disk at `next_address`.
    Continue { next_address: Address },
}

enum Trace {
    Found(Address),
    BelowHead(Address),
    NotFound,
}

enum LockOutcome {
    Acquired,
    Replaced,
}

/// Per-session registration visible to checkpoints.
pub(crate) struct SessionEntry {
    pub(crate) guid: Uuid,
    pub(crate) serial: AtomicU64,
    pub(crate) active: AtomicBool,
}

/// Addresses captured at the checkpoint cut.
#[derive(Clone)]
struct CheckpointCut {
    begin: Address,
    head: Address,
    tail: Address,
    sessions: Vec<SessionSnapshot>,
}

/// The engine handle. Shared across sessions behind `Arc`.
pub struct TideKv<K: Key, V: Value, D: StorageDevice> {
    this: Weak<Self>,
    config: TideKvConfig,
    epoch: Arc<EpochManager>,
    index: HashIndex,
    hlog: Arc<HybridLog<D>>,
    state: AtomicSystemState,
    sessions: Mutex<HashMap<Uuid, Arc<SessionEntry>>>,
    recovered_sessions: Mutex<HashMap<Uuid, u64>>,
    page_in: PageInManager<D>,
    cut: Mutex<Option<CheckpointCut>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: Key, V: Value, D: StorageDevice> TideKv<K, V, D> {
    /// Open a fresh store.
    pub fn open(config: TideKvConfig, device: D) -> Result<Arc<Self>, Status> {
        config.validate()?;
        let device = Arc::new(device);
        let epoch = Arc::new(EpochManager::new());

        let mut index = HashIndex::new();
        let status = index.initialize(config.table_size);
        if status != Status::Ok {
            return Err(status);
        }

        let log_config = HybridLogConfig::new(
            config.log_memory_size,
            config.page_size_bits,
            config.mutable_fraction,
        )?;
        let hlog = HybridLog::new(log_config, device.clone(), epoch.clone())?;
        let page_in = PageInManager::new(device);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            epoch,
            index,
            hlog,
            state: AtomicSystemState::new(1),
            sessions: Mutex::new(HashMap::new()),
            recovered_sessions: Mutex::new(HashMap::new()),
            page_in,
            cut: Mutex::new(None),
            _marker: PhantomData,
        }))
    }

    /// A strong handle to this engine. Infallible while any caller holds
    /// a borrow of the engine.
    fn handle(&self) -> Arc<Self> {
        self.this.upgrade().expect("engine handle alive")
    }

    /// The epoch manager.
    pub(crate) fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    pub(crate) fn page_in(&self) -> &PageInManager<D> {
        &self.page_in
    }

    /// Open a session. One session per thread.
    pub fn open_session(&self) -> Session<K, V, D> {
        let guid = Uuid::new_v4();
        Session::open(self.handle(), guid, 0)
    }

    /// Resume a session known from a recovered checkpoint. Returns the
    /// session positioned after its last persisted serial.
    pub fn continue_session(&self, guid: Uuid) -> Result<Session<K, V, D>, Status> {
        let last_serial = self
            .recovered_sessions
            .lock()
            .get(&guid)
            .copied()
            .ok_or(Status::NotFound)?;
        Ok(Session::open(self.handle(), guid, last_serial))
    }

    pub(crate) fn register_session(&self, guid: Uuid) -> Arc<SessionEntry> {
        let entry = Arc::new(SessionEntry {
            guid,
            serial: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });
        self.sessions.lock().insert(guid, entry.clone());
        entry
    }

    pub(crate) fn unregister_session(&self, guid: Uuid) {
        self.sessions.lock().remove(&guid);
    }

    /// Bytes between the begin and tail anchors.
    pub fn size(&self) -> u64 {
        self.hlog.tail_address() - self.hlog.begin_address()
    }

    /// Log anchor positions.
    pub fn log_stats(&self) -> LogStats {
        self.hlog.stats()
    }

    /// Hash index distribution.
    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Current engine version (bumped by completed checkpoints).
    pub fn version(&self) -> u32 {
        self.state.load(Ordering::Acquire).version
    }

    /// Raise the read-only anchor to the current tail, freezing all records
    /// appended so far against in-place updates.
    pub fn shift_read_only_to_tail(&self) {
        let tail = self.hlog.tail_address();
        self.hlog.shift_read_only(tail);
    }

    /// Truncate the log below `new_begin` and drop index entries that point
    /// below it.
    pub fn truncate(&self, new_begin: Address) -> u64 {
        let begin = self.hlog.shift_begin(new_begin);
        self.index.garbage_collect(begin)
    }

    /// Scan the resident portion of the log, `[head, tail)` at call time.
    pub fn scan_in_memory(&self) -> LogScanIterator<K, V, D> {
        let begin = self.hlog.head_address();
        let end = self.hlog.tail_address();
        self.scan(begin, end)
    }

    /// Scan `[begin_scan, end_scan)`; both bounds must be at or above the
    /// head address.
    pub fn scan(&self, begin_scan: Address, end_scan: Address) -> LogScanIterator<K, V, D> {
        LogScanIterator::new(self.hlog.clone(), self.epoch.clone(), begin_scan, end_scan)
    }

    #[inline]
    unsafe fn record_at(&self, address: Address) -> &Record<K, V> {
        Record::from_ptr(self.hlog.get(address))
    }

    pub(crate) fn device_offset(&self, address: Address) -> u64 {
        address.page() as u64 * self.hlog.page_size() as u64 + address.offset() as u64
    }

    /// Walk the record chain starting at `address` looking for `key`.
    fn trace_key(&self, mut address: Address, key: &K) -> Trace {
        let head = self.hlog.head_address();
        let begin = self.hlog.begin_address();
        while address.is_valid() && address >= head {
            // SAFETY: address is resident (>= head) and we hold an epoch
            // entry, so the page cannot be recycled under us.
            let record = unsafe { self.record_at(address) };
            if !record.header.is_invalid() && unsafe { record.key() } == key {
                return Trace::Found(address);
            }
            address = record.header.previous_address();
        }
        if address.is_valid() && address >= begin {
            Trace::BelowHead(address)
        } else {
            Trace::NotFound
        }
    }

    fn lock_for_update(&self, lock: &AtomicGenLock) -> LockOutcome {
        loop {
            match lock.try_lock() {
                TryLock::Acquired => return LockOutcome::Acquired,
                TryLock::Replaced => return LockOutcome::Replaced,
                TryLock::Busy => std::thread::yield_now(),
            }
        }
    }

    /// Whether appended records belong to the version after an in-flight
    /// checkpoint cut.
    fn appending_new_version(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        matches!(
            state.action,
            Action::CheckpointFull | Action::CheckpointLog
        ) && matches!(
            state.phase,
            Phase::InProgress | Phase::WaitPending | Phase::WaitFlush | Phase::PersistenceCallback
        )
    }

    /// Reserve, fill and return a record. The header is written last, so a
    /// concurrent scan treats the record as absent until it is whole.
    fn append_record(
        &self,
        key: &K,
        previous: Address,
        tombstone: bool,
        init: impl Fn(&mut V),
    ) -> Result<Address, Status> {
        let size = Record::<K, V>::record_size();
        let address = self.hlog.allocate(size)?;
        // SAFETY: freshly reserved bytes, exclusively ours until published.
        let record = unsafe { Record::<K, V>::from_ptr_mut(self.hlog.get_mut(address)) };
        unsafe { record.write_key(key.clone()) };
        if !tombstone {
            // Record memory is zeroed; the context builds the value in
            // place.
            init(unsafe { record.value_mut() });
        }
        let control =
            RecordHeader::control_word(previous, tombstone, self.appending_new_version());
        record.header.store(control, Ordering::Release);
        Ok(address)
    }

    /// Bitwise-copy a value out of a record, using the generation protocol
    /// when the value is in-place mutable. The returned copy is never
    /// dropped as `V` (values are plain data).
    unsafe fn snapshot_value(&self, record: &Record<K, V>) -> ManuallyDrop<V> {
        let value = record.value();
        let Some(lock) = value.gen_lock() else {
            return ManuallyDrop::new(std::ptr::read(value));
        };
        loop {
            let before = lock.load();
            if before.is_locked() {
                std::thread::yield_now();
                continue;
            }
            let copy = std::ptr::read(value);
            let after = lock.load();
            if before.gen_number() == after.gen_number() && !after.is_locked() {
                return ManuallyDrop::new(copy);
            }
            std::mem::forget(copy);
            std::thread::yield_now();
        }
    }

    /// Block while an index grow is migrating, contributing chunks.
    fn wait_if_growing(&self) {
        loop {
            let phase = self.state.load(Ordering::Acquire).phase;
            if phase != Phase::GrowPrepare && phase != Phase::GrowInProgress {
                return;
            }
            self.grow_cooperate();
            self.epoch.refresh(current_thread_id());
            std::thread::yield_now();
        }
    }

    // ---- Upsert ----

    pub(crate) fn internal_upsert<C: UpsertContext<K, V>>(&self, ctx: &C) -> OpResult {
        let hash = KeyHash::new(ctx.key().get_hash());
        loop {
            self.wait_if_growing();
            let find = self.index.find_or_create_entry(hash);
            let chain_head = find.entry.address();

            match self.trace_key(chain_head, ctx.key()) {
                Trace::Found(address) => {
                    // SAFETY: resident and epoch-protected (see trace_key).
                    let record = unsafe { self.record_at(address) };
                    if !record.header.is_tombstone() && self.hlog.is_mutable(address) {
                        if let Some(lock) = unsafe { record.value() }.gen_lock() {
                            match self.lock_for_update(lock) {
                                LockOutcome::Acquired => {
                                    // SAFETY: generation lock held.
                                    let fits = ctx.put_atomic(unsafe { record.value_mut() });
                                    lock.unlock(!fits);
                                    if fits {
                                        return OpResult::Done(Status::Ok);
                                    }
                                    // Marked replaced; fall through to append.
                                }
                                LockOutcome::Replaced => continue,
                            }
                        }
                    }
                }
                Trace::BelowHead(address) => return OpResult::GoAsync { address },
                Trace::NotFound => {}
            }

            let new_address =
                match self.append_record(ctx.key(), chain_head, false, |value| ctx.put(value)) {
                    Ok(address) => address,
                    Err(status) => return OpResult::Done(status),
                };
            if find.try_update(new_address, hash.tag()) {
                return OpResult::Done(Status::Ok);
            }
            // Lost the bucket race; the record is unreachable garbage.
            // SAFETY: our own allocation.
            unsafe { self.record_at(new_address) }.header.set_invalid();
        }
    }

    // ---- Read ----

    pub(crate) fn internal_read<C: ReadContext<K, V>>(&self, ctx: &mut C) -> OpResult {
        let hash = KeyHash::new(ctx.key().get_hash());
        self.wait_if_growing();
        let find = self.index.find_entry(hash);
        if !find.found() {
            return OpResult::Done(Status::NotFound);
        }
        match self.trace_key(find.entry.address(), ctx.key()) {
            Trace::Found(address) => {
                // SAFETY: resident and epoch-protected.
                let record = unsafe { self.record_at(address) };
                if record.header.is_tombstone() {
                    return OpResult::Done(Status::NotFound);
                }
                let value = unsafe { record.value() };
                if address >= self.hlog.safe_read_only_address() {
                    if let Some(lock) = value.gen_lock() {
                        // Torn-read protocol: retry the copy until the
                        // generation is stable across it.
                        loop {
                            let before = lock.load();
                            if before.is_locked() {
                                std::thread::yield_now();
                                continue;
                            }
                            ctx.get_atomic(value);
                            let after = lock.load();
                            if before.gen_number() == after.gen_number() && !after.is_locked() {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    } else {
                        ctx.get(value);
                    }
                } else {
                    ctx.get(value);
                }
                OpResult::Done(Status::Ok)
            }
            Trace::BelowHead(address) => OpResult::GoAsync { address },
            Trace::NotFound => OpResult::Done(Status::NotFound),
        }
    }

    // ---- RMW ----

    pub(crate) fn internal_rmw<C: RmwContext<K, V>>(&self, ctx: &C) -> OpResult {
        let hash = KeyHash::new(ctx.key().get_hash());
        loop {
            self.wait_if_growing();
            let find = self.index.find_or_create_entry(hash);
            let chain_head = find.entry.address();

            let found = match self.trace_key(chain_head, ctx.key()) {
                Trace::Found(address) => {
                    // SAFETY: resident and epoch-protected.
                    let record = unsafe { self.record_at(address) };
                    if record.header.is_tombstone() {
                        None
                    } else {
                        Some((address, record))
                    }
                }
                Trace::BelowHead(address) => return OpResult::GoAsync { address },
                Trace::NotFound => None,
            };

            let new_address = match found {
                Some((address, record)) => {
                    if self.hlog.is_mutable(address) {
                        if let Some(lock) = unsafe { record.value() }.gen_lock() {
                            match self.lock_for_update(lock) {
                                LockOutcome::Acquired => {
                                    // SAFETY: generation lock held.
                                    let done = ctx.rmw_atomic(unsafe { record.value_mut() });
                                    lock.unlock(!done);
                                    if done {
                                        return OpResult::Done(Status::Ok);
                                    }
                                }
                                LockOutcome::Replaced => continue,
                            }
                        }
                    }
                    // Copy-on-update: snapshot the old value first, the
                    // allocation below may trigger eviction.
                    let old = unsafe { self.snapshot_value(record) };
                    let result = self.append_record(ctx.key(), chain_head, false, |dest| {
                        ctx.rmw_copy(&old, dest)
                    });
                    match result {
                        Ok(address) => address,
                        Err(status) => return OpResult::Done(status),
                    }
                }
                None => {
                    // Absent (or tombstoned): build the initial value,
                    // chaining past whatever the bucket held.
                    let result = self.append_record(ctx.key(), chain_head, false, |dest| {
                        ctx.rmw_initial(dest)
                    });
                    match result {
                        Ok(address) => address,
                        Err(status) => return OpResult::Done(status),
                    }
                }
            };

            if find.try_update(new_address, hash.tag()) {
                return OpResult::Done(Status::Ok);
            }
            // SAFETY: our own allocation.
            unsafe { self.record_at(new_address) }.header.set_invalid();
        }
    }

    // ---- Delete ----

    pub(crate) fn internal_delete<C: DeleteContext<K>>(&self, ctx: &C) -> OpResult {
        let hash = KeyHash::new(ctx.key().get_hash());
        loop {
            self.wait_if_growing();
            let find = self.index.find_or_create_entry(hash);
            let chain_head = find.entry.address();

            let new_address =
                match self.append_record(ctx.key(), chain_head, true, |_value| {}) {
                    Ok(address) => address,
                    Err(status) => return OpResult::Done(status),
                };
            if find.try_update(new_address, hash.tag()) {
                return OpResult::Done(Status::Ok);
            }
            // SAFETY: our own allocation.
            unsafe { self.record_at(new_address) }.header.set_invalid();
        }
    }

    // ---- Pending resolution ----

    /// Resolve a pending operation against paged-in record bytes.
    pub(crate) fn resolve_pending(
        &self,
        op: &mut PendingOp<K, V>,
        buf: &RecordBuf,
    ) -> PendingOutcome {
        // SAFETY: the buffer holds one record image, 8-aligned.
        let record = unsafe { Record::<K, V>::from_ptr(buf.as_ptr()) };
        let key_matches = {
            let key = unsafe { record.key() };
            match &op.kind {
                PendingKind::Read(ctx) => ctx.key() == key,
                PendingKind::Upsert(ctx) => ctx.key() == key,
                PendingKind::Rmw(ctx) => ctx.key() == key,
            }
        };

        // Lost-CAS records and foreign keys are skipped; the chain
        // continues at the back-pointer, possibly deeper on disk.
        if record.header.is_invalid() || !key_matches {
            let previous = record.header.previous_address();
            if previous.is_valid() && previous >= self.hlog.begin_address() {
                return PendingOutcome::Continue {
                    next_address: previous,
                };
            }
        }

        let exists = key_matches && !record.header.is_invalid() && !record.header.is_tombstone();
        match &mut op.kind {
            PendingKind::Read(ctx) => {
                if exists {
                    // On-disk records are immutable; the stable getter
                    // applies.
                    ctx.get(unsafe { record.value() });
                    PendingOutcome::Completed(Status::Ok)
                } else {
                    PendingOutcome::Completed(Status::NotFound)
                }
            }
            PendingKind::Upsert(ctx) => {
                let status = self.append_and_install(ctx.key(), |dest| ctx.put(dest));
                PendingOutcome::Completed(status)
            }
            PendingKind::Rmw(ctx) => {
                let status = if exists {
                    let old = unsafe { record.value() };
                    self.append_and_install(ctx.key(), |dest| ctx.rmw_copy(old, dest))
                } else {
                    self.append_and_install(ctx.key(), |dest| ctx.rmw_initial(dest))
                };
                PendingOutcome::Completed(status)
            }
        }
    }

    /// Append a record for `key` and install it at the chain head,
    /// retrying bucket races. Used by pending resolution, which has already
    /// located the key's on-disk state.
    fn append_and_install(&self, key: &K, init: impl Fn(&mut V)) -> Status {
        let hash = KeyHash::new(key.get_hash());
        loop {
            let find = self.index.find_or_create_entry(hash);
            let chain_head = find.entry.address();
            let new_address = match self.append_record(key, chain_head, false, &init) {
                Ok(address) => address,
                Err(status) => return status,
            };
            if find.try_update(new_address, hash.tag()) {
                return Status::Ok;
            }
            // SAFETY: our own allocation.
            unsafe { self.record_at(new_address) }.header.set_invalid();
        }
    }

    // ---- Index growth ----

    fn rehash_address(&self, address: Address) -> Option<KeyHash> {
        if address < self.hlog.head_address() {
            return None;
        }
        // SAFETY: resident and epoch-protected.
        let record = unsafe { self.record_at(address) };
        Some(KeyHash::new(unsafe { record.key() }.get_hash()))
    }

    /// Contribute one migration chunk if a grow is in flight. Sessions call
    /// this from `refresh`.
    pub(crate) fn grow_cooperate(&self) {
        if self.state.load(Ordering::Acquire).phase != Phase::GrowInProgress {
            return;
        }
        if !self.index.grow_in_progress() {
            return;
        }
        let rehash = |address: Address| self.rehash_address(address);
        self.index.migrate_chunk(&rehash);
        let _ = self.index.complete_grow();
    }

    /// Double the hash index. Returns false if another structural action is
    /// running.
    pub fn grow_index(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if state.phase != Phase::Rest {
            return false;
        }
        let prepare = SystemState::new(Action::GrowIndex, Phase::GrowPrepare, state.version);
        if self.state.compare_exchange(state, prepare).is_err() {
            return false;
        }

        // Open the migration once every session has crossed the epoch.
        let store = self.handle();
        let version = state.version;
        self.epoch.bump_epoch_with_action(move || {
            if store.index.start_grow().is_ok() {
                store.state.store(
                    SystemState::new(Action::GrowIndex, Phase::GrowInProgress, version),
                    Ordering::Release,
                );
            } else {
                store.state.store(SystemState::rest(version), Ordering::Release);
            }
        });

        let thread_id = current_thread_id();
        loop {
            let phase = self.state.load(Ordering::Acquire).phase;
            if phase == Phase::GrowInProgress {
                break;
            }
            if phase == Phase::Rest {
                return false; // start_grow lost a race
            }
            self.epoch.refresh(thread_id);
            std::thread::yield_now();
        }

        let rehash = |address: Address| self.rehash_address(address);
        loop {
            self.index.migrate_chunk(&rehash);
            match self.index.complete_grow() {
                Status::Pending => std::thread::yield_now(),
                _ => break,
            }
        }
        self.state
            .store(SystemState::rest(version), Ordering::Release);
        true
    }

    // ---- Checkpoint & recovery ----

    fn capture_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .values()
            .filter(|entry| entry.active.load(Ordering::Acquire))
            .map(|entry| SessionSnapshot {
                guid: entry.guid,
                serial: entry.serial.load(Ordering::Acquire),
            })
            .collect()
    }

    fn wait_for_phase(&self, target: Phase) {
        let thread_id = current_thread_id();
        loop {
            if self.state.load(Ordering::Acquire).phase == target {
                return;
            }
            self.epoch.refresh(thread_id);
            std::thread::yield_now();
        }
    }

    /// Schedule a phase transition at the next epoch boundary and wait for
    /// it to take effect.
    fn transition(&self, action: Action, phase: Phase, version: u32) {
        let store = self.handle();
        self.epoch.bump_epoch_with_action(move || {
            store
                .state
                .store(SystemState::new(action, phase, version), Ordering::Release);
        });
        self.wait_for_phase(phase);
    }

    /// Take a full checkpoint (index image + log suffix) and return its
    /// token.
    pub fn checkpoint(&self) -> Result<CheckpointToken, Status> {
        self.run_log_checkpoint(Action::CheckpointFull)
    }

    /// Take a log-only checkpoint.
    pub fn checkpoint_log(&self) -> Result<CheckpointToken, Status> {
        self.run_log_checkpoint(Action::CheckpointLog)
    }

    /// Take an index-only checkpoint.
    pub fn checkpoint_index(&self) -> Result<CheckpointToken, Status> {
        let Some(dir) = self.config.checkpoint_dir.clone() else {
            return Err(Status::InvalidOperation);
        };
        let state = self.state.load(Ordering::Acquire);
        if state.phase != Phase::Rest {
            return Err(Status::Aborted);
        }
        let in_progress =
            SystemState::new(Action::CheckpointIndex, Phase::InProgress, state.version);
        if self.state.compare_exchange(state, in_progress).is_err() {
            return Err(Status::Aborted);
        }

        let token = Uuid::new_v4();
        let image = self.index.snapshot();
        let meta = IndexMetadata {
            token,
            version: state.version,
            table_size: image.table_size,
            overflow_count: image.overflow.len() as u64,
            checkpoint_start: self.hlog.tail_address().control(),
        };
        let result = checkpoint::write_index(&dir, &meta, &image);
        self.state
            .store(SystemState::rest(state.version), Ordering::Release);
        match result {
            Ok(()) => Ok(token),
            Err(e) => {
                tracing::warn!(error = %e, "index checkpoint failed");
                Err(Status::IoError)
            }
        }
    }

    fn run_log_checkpoint(&self, action: Action) -> Result<CheckpointToken, Status> {
        let Some(dir) = self.config.checkpoint_dir.clone() else {
            return Err(Status::InvalidOperation);
        };
        let state = self.state.load(Ordering::Acquire);
        if state.phase != Phase::Rest {
            return Err(Status::Aborted);
        }
        let version = state.version;
        let prepare = SystemState::new(action, Phase::Prepare, version);
        if self.state.compare_exchange(state, prepare).is_err() {
            return Err(Status::Aborted);
        }

        let token = Uuid::new_v4();

        // Prepare -> InProgress: take the cut at an epoch boundary, so every
        // session has published its serial and no pre-cut operation is still
        // mid-flight.
        let store = self.handle();
        self.epoch.bump_epoch_with_action(move || {
            let cut = CheckpointCut {
                begin: store.hlog.begin_address(),
                head: store.hlog.head_address(),
                tail: store.hlog.tail_address(),
                sessions: store.capture_sessions(),
            };
            *store.cut.lock() = Some(cut);
            store.state.store(
                SystemState::new(action, Phase::InProgress, version),
                Ordering::Release,
            );
        });
        self.wait_for_phase(Phase::InProgress);
        let cut = self
            .cut
            .lock()
            .clone()
            .expect("checkpoint cut present in InProgress");

        // Fuzzy index image (full checkpoints only). Entries past the cut
        // are rebuilt from the log scan at recovery.
        let index_result = if action == Action::CheckpointFull {
            let image = self.index.snapshot();
            let meta = IndexMetadata {
                token,
                version,
                table_size: image.table_size,
                overflow_count: image.overflow.len() as u64,
                checkpoint_start: cut.tail.control(),
            };
            checkpoint::write_index(&dir, &meta, &image)
        } else {
            Ok(())
        };

        self.transition(action, Phase::WaitPending, version);
        self.transition(action, Phase::WaitFlush, version);

        // Capture the resident pages covering [head, tail].
        let page_size = self.hlog.page_size();
        let first_page = cut.head.page();
        let last_page = cut.tail.page();
        let mut pages = Vec::with_capacity((last_page - first_page + 1) as usize);
        for page in first_page..=last_page {
            let mut bytes = vec![0u8; page_size];
            self.hlog.copy_page_into(page, &mut bytes);
            pages.push(bytes);
        }
        let log_meta = LogMetadata {
            token,
            version,
            page_size_bits: self.config.page_size_bits,
            begin_address: cut.begin.control(),
            head_address: cut.head.control(),
            checkpoint_tail: cut.tail.control(),
            sessions: cut.sessions.clone(),
        };
        let log_result = checkpoint::write_log(
            &dir,
            &log_meta,
            &LogPages {
                first_page,
                page_size,
                pages,
            },
        );

        self.transition(action, Phase::PersistenceCallback, version);
        *self.cut.lock() = None;

        match index_result.and(log_result) {
            Ok(()) => {
                self.state
                    .store(SystemState::rest(version + 1), Ordering::Release);
                Ok(token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint failed");
                self.state
                    .store(SystemState::rest(version), Ordering::Release);
                Err(Status::IoError)
            }
        }
    }

    /// Build a store from checkpoint artifacts. The device must be the log
    /// device the original store was writing to (records below the
    /// checkpoint's head address are read from it on demand).
    pub fn recover(
        config: TideKvConfig,
        device: D,
        index_token: CheckpointToken,
        log_token: CheckpointToken,
    ) -> Result<(Arc<Self>, RecoveryResult), Status> {
        config.validate()?;
        let Some(dir) = config.checkpoint_dir.clone() else {
            return Err(Status::InvalidOperation);
        };

        let (index_meta, image) =
            checkpoint::read_index(&dir, index_token).map_err(|e| read_error("index", e))?;
        let (log_meta, pages) =
            checkpoint::read_log(&dir, log_token).map_err(|e| read_error("log", e))?;
        if log_meta.page_size_bits != config.page_size_bits {
            return Err(Status::Corruption);
        }

        let begin = Address::from_control(log_meta.begin_address);
        let head = Address::from_control(log_meta.head_address);
        let tail = Address::from_control(log_meta.checkpoint_tail);
        let index_cut = Address::from_control(index_meta.checkpoint_start);
        if !(begin <= head && head <= tail) || index_cut > tail {
            return Err(Status::Corruption);
        }

        let device = Arc::new(device);
        let epoch = Arc::new(EpochManager::new());

        let mut index = HashIndex::new();
        let status = index.restore(&image);
        if status != Status::Ok {
            return Err(status);
        }

        let log_config = HybridLogConfig::new(
            config.log_memory_size,
            config.page_size_bits,
            config.mutable_fraction,
        )?;
        if pages.pages.len() > log_config.memory_pages as usize {
            // The checkpoint's resident window must fit this store's ring.
            return Err(Status::InvalidArgument);
        }
        let hlog = HybridLog::new(log_config, device.clone(), epoch.clone())?;
        for (i, bytes) in pages.pages.iter().enumerate() {
            hlog.load_page(pages.first_page + i as u32, bytes);
        }
        hlog.reopen_page(tail.page());
        hlog.initialize_from_recovery(begin, head, tail);

        let page_in = PageInManager::new(device);
        let store = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            epoch,
            index,
            hlog,
            state: AtomicSystemState::new(log_meta.version + 1),
            sessions: Mutex::new(HashMap::new()),
            recovered_sessions: Mutex::new(
                log_meta
                    .sessions
                    .iter()
                    .map(|s| (s.guid, s.serial))
                    .collect(),
            ),
            page_in,
            cut: Mutex::new(None),
            _marker: PhantomData,
        });

        // The index image is fuzzy: entries at or past the index cut may
        // reference records that never made it into the artifact. Drop
        // them, then rebuild from the recovered log suffix.
        store.index.garbage_collect(begin);
        store.drop_entries_at_or_above(index_cut.min(tail));
        store.replay_log(head, tail);

        let result = RecoveryResult {
            version: log_meta.version,
            sessions: log_meta.sessions.clone(),
        };
        Ok((store, result))
    }

    fn drop_entries_at_or_above(&self, bound: Address) {
        let dropped = self.index.drop_at_or_above(bound);
        if dropped > 0 {
            tracing::debug!(dropped, "dropped fuzzy index entries past the checkpoint cut");
        }
    }

    /// Rebuild index entries from the recovered records in `[from, until)`.
    fn replay_log(&self, from: Address, until: Address) {
        let record_size = Record::<K, V>::record_size();
        let page_size = self.hlog.page_size() as u32;
        let mut cursor = from;
        while cursor < until {
            if cursor.offset() + record_size > page_size {
                cursor = Address::new(cursor.page() + 1, 0);
                continue;
            }
            // SAFETY: recovery owns the store; the pages were just loaded.
            let record = unsafe { self.record_at(cursor) };
            if record.header.is_null() {
                // Rest of the page was never written.
                cursor = Address::new(cursor.page() + 1, 0);
                continue;
            }
            let address = cursor;
            cursor = address + record_size as u64;
            if record.header.is_invalid() || record.header.in_new_version() {
                continue;
            }
            let hash = KeyHash::new(unsafe { record.key() }.get_hash());
            let find = self.index.find_or_create_entry(hash);
            find.force_update(address, hash.tag());
        }
    }
}

fn read_error(artifact: &str, e: std::io::Error) -> Status {
    if e.kind() == std::io::ErrorKind::InvalidData {
        tracing::warn!(artifact, error = %e, "checkpoint artifact corrupted");
        Status::Corruption
    } else {
        tracing::warn!(artifact, error = %e, "checkpoint artifact unreadable");
        Status::IoError
    }
}

impl<K: Key, V: Value, D: StorageDevice> Drop for TideKv<K, V, D> {
    fn drop(&mut self) {
        self.page_in.shutdown();
        self.hlog.shutdown();
    }
}
