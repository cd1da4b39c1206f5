//! Sessions: the per-thread handle through which all operations flow.
//!
//! A session owns an epoch entry, a strictly increasing serial number and
//! the queue of operations that went pending. Sessions are not `Sync`; one
//! session per thread.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use uuid::Uuid;

use crate::device::StorageDevice;
use crate::epoch::ThreadId;
use crate::record::{Key, Record, Value};
use crate::status::Status;

use super::contexts::{DeleteContext, ReadContext, RmwContext, UpsertContext};
use super::kv::{OpResult, PendingOutcome, SessionEntry, TideKv};
use super::pending::{PendingKind, PendingOp};

/// A session on a [`TideKv`] store.
pub struct Session<K: Key, V: Value, D: StorageDevice> {
    store: Arc<TideKv<K, V, D>>,
    guid: Uuid,
    thread_id: ThreadId,
    entry: Arc<SessionEntry>,
    last_serial: u64,
    pending: VecDeque<PendingOp<K, V>>,
    active: bool,
}

impl<K: Key, V: Value, D: StorageDevice> Session<K, V, D> {
    pub(crate) fn open(store: Arc<TideKv<K, V, D>>, guid: Uuid, last_serial: u64) -> Self {
        let thread_id = crate::epoch::current_thread_id();
        // Reentrant: a scan iterator on the same thread nests its own epoch
        // entry inside the session's.
        store.epoch().reentrant_protect(thread_id);
        let entry = store.register_session(guid);
        entry.serial.store(last_serial, Ordering::Release);
        Self {
            store,
            guid,
            thread_id,
            entry,
            last_serial,
            pending: VecDeque::new(),
            active: true,
        }
    }

    /// The session identifier, as persisted by checkpoints.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// The last serial number issued on this session.
    pub fn last_serial(&self) -> u64 {
        self.last_serial
    }

    /// Number of queued pending operations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn begin_op(&mut self, serial: u64) {
        assert!(self.active, "operation issued on a closed session");
        assert!(
            serial > self.last_serial,
            "serial numbers must be strictly increasing (last {}, got {})",
            self.last_serial,
            serial
        );
        self.last_serial = serial;
        self.entry.serial.store(serial, Ordering::Release);
    }

    /// Insert or overwrite the context's key.
    pub fn upsert<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: UpsertContext<K, V> + Clone + 'static,
    {
        self.begin_op(serial);
        match self.store.internal_upsert(ctx) {
            OpResult::Done(status) => status,
            OpResult::GoAsync { address } => {
                self.enqueue(PendingKind::Upsert(Box::new(ctx.clone())), serial, address);
                Status::Pending
            }
        }
    }

    /// Read the context's key.
    pub fn read<C>(&mut self, ctx: &mut C, serial: u64) -> Status
    where
        C: ReadContext<K, V> + Clone + 'static,
    {
        self.begin_op(serial);
        match self.store.internal_read(ctx) {
            OpResult::Done(status) => status,
            OpResult::GoAsync { address } => {
                self.enqueue(PendingKind::Read(Box::new(ctx.clone())), serial, address);
                Status::Pending
            }
        }
    }

    /// Read-modify-write the context's key.
    pub fn rmw<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: RmwContext<K, V> + Clone + 'static,
    {
        self.begin_op(serial);
        match self.store.internal_rmw(ctx) {
            OpResult::Done(status) => status,
            OpResult::GoAsync { address } => {
                self.enqueue(PendingKind::Rmw(Box::new(ctx.clone())), serial, address);
                Status::Pending
            }
        }
    }

    /// Delete the context's key. Never fails due to absence and never goes
    /// pending.
    pub fn delete<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: DeleteContext<K>,
    {
        self.begin_op(serial);
        match self.store.internal_delete(ctx) {
            OpResult::Done(status) => status,
            OpResult::GoAsync { .. } => unreachable!("delete never goes pending"),
        }
    }

    fn enqueue(&mut self, kind: PendingKind<K, V>, serial: u64, address: crate::address::Address) {
        let io_id = self.submit_record_read(address);
        self.pending.push_back(PendingOp {
            kind,
            serial,
            address,
            io_id,
        });
    }

    fn submit_record_read(&self, address: crate::address::Address) -> u64 {
        let len = Record::<K, V>::record_size() as usize;
        self.store
            .page_in()
            .submit(self.store.device_offset(address), len)
    }

    /// Pass through an epoch safe point: publish the current epoch, run any
    /// drain actions that became safe, and contribute to an in-flight index
    /// migration.
    pub fn refresh(&mut self) {
        self.store.epoch().refresh(self.thread_id);
        self.store.grow_cooperate();
    }

    /// Drive the pending queue. With `wait` set, blocks (refreshing the
    /// epoch) until every pending operation has completed; otherwise makes
    /// one pass. Returns true when the queue is empty.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        loop {
            let mut remaining = VecDeque::new();
            while let Some(mut op) = self.pending.pop_front() {
                match self.store.page_in().take(op.io_id) {
                    None => remaining.push_back(op),
                    Some(Err(e)) => {
                        tracing::warn!(serial = op.serial, error = %e, "pending page-in failed");
                        op.kind.complete(Status::IoError);
                    }
                    Some(Ok(buf)) => match self.store.resolve_pending(&mut op, &buf) {
                        PendingOutcome::Completed(status) => op.kind.complete(status),
                        PendingOutcome::Continue { next_address } => {
                            op.address = next_address;
                            op.io_id = self.submit_record_read(next_address);
                            remaining.push_back(op);
                        }
                    },
                }
            }
            self.pending = remaining;
            if self.pending.is_empty() {
                return true;
            }
            if !wait {
                return false;
            }
            self.refresh();
            std::thread::yield_now();
        }
    }

    /// Drain pending work and release the session's epoch entry.
    pub fn close(&mut self) {
        if !self.active {
            return;
        }
        self.complete_pending(true);
        self.entry.active.store(false, Ordering::Release);
        self.store.unregister_session(self.guid);
        self.store.epoch().reentrant_unprotect(self.thread_id);
        self.active = false;
    }
}

impl<K: Key, V: Value, D: StorageDevice> Drop for Session<K, V, D> {
    fn drop(&mut self) {
        self.close();
    }
}
