//! Pending operations and the page-in worker.
//!
//! When an operation's target record has fallen below the head address, the
//! operation deep-copies its context onto the session's pending queue and a
//! read for the record bytes is handed to the page-in worker. The worker
//! owns a small tokio runtime (the device interface is async) and parks
//! completions in a map keyed by request id; `complete_pending` picks them
//! up and resumes the operation.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::record::{Key, Value};

use super::contexts::{ReadContext, RmwContext, UpsertContext};

/// Record bytes read back from the device, held in `u64` storage so the
/// record view is properly aligned.
pub(crate) struct RecordBuf {
    words: Vec<u64>,
    len: usize,
}

impl RecordBuf {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: the u64 storage covers at least `len` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    /// Base pointer, 8-aligned.
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }
}

enum IoRequest {
    Read { id: u64, offset: u64, len: usize },
    Shutdown,
}

/// Store-global page-in worker.
pub(crate) struct PageInManager<D: StorageDevice> {
    tx: Sender<IoRequest>,
    completed: Arc<Mutex<HashMap<u64, io::Result<RecordBuf>>>>,
    next_id: AtomicU64,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    _device: PhantomData<fn() -> D>,
}

impl<D: StorageDevice> PageInManager<D> {
    pub(crate) fn new(device: Arc<D>) -> Self {
        let (tx, rx) = unbounded::<IoRequest>();
        let completed: Arc<Mutex<HashMap<u64, io::Result<RecordBuf>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let completions = completed.clone();

        let worker = thread::Builder::new()
            .name("tidekv-page-in".into())
            .spawn(move || run_worker(rx, completions, device))
            .expect("spawn page-in worker");

        Self {
            tx,
            completed,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
            _device: PhantomData,
        }
    }

    /// Submit a read of `len` bytes at `offset`; returns the request id.
    pub(crate) fn submit(&self, offset: u64, len: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(IoRequest::Read { id, offset, len }).is_err() {
            // Worker gone (shutdown); park an error so the caller resolves.
            self.completed
                .lock()
                .insert(id, Err(io::Error::other("page-in worker stopped")));
        }
        id
    }

    /// Take the completion for `id`, if it has arrived.
    pub(crate) fn take(&self, id: u64) -> Option<io::Result<RecordBuf>> {
        self.completed.lock().remove(&id)
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<D: StorageDevice>(
    rx: Receiver<IoRequest>,
    completed: Arc<Mutex<HashMap<u64, io::Result<RecordBuf>>>>,
    device: Arc<D>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::warn!(error = %e, "page-in worker failed to build runtime");
            return;
        }
    };

    while let Ok(request) = rx.recv() {
        let (id, offset, len) = match request {
            IoRequest::Read { id, offset, len } => (id, offset, len),
            IoRequest::Shutdown => break,
        };
        let mut buf = RecordBuf::new(len);
        let result = runtime.block_on(async {
            let n = device.read(offset, buf.as_mut_bytes()).await?;
            if n != len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short page-in: wanted {len}, got {n}"),
                ));
            }
            Ok(())
        });
        completed.lock().insert(id, result.map(|()| buf));
    }
}

/// The deep-copied context of an operation that went pending.
pub(crate) enum PendingKind<K: Key, V: Value> {
    Read(Box<dyn ReadContext<K, V>>),
    Upsert(Box<dyn UpsertContext<K, V>>),
    Rmw(Box<dyn RmwContext<K, V>>),
}

impl<K: Key, V: Value> PendingKind<K, V> {
    /// Fire the context's completion callback.
    pub(crate) fn complete(&mut self, status: crate::status::Status) {
        match self {
            PendingKind::Read(ctx) => ctx.on_complete(status),
            PendingKind::Upsert(ctx) => ctx.on_complete(status),
            PendingKind::Rmw(ctx) => ctx.on_complete(status),
        }
    }
}

/// One queued pending operation.
pub(crate) struct PendingOp<K: Key, V: Value> {
    pub(crate) kind: PendingKind<K, V>,
    pub(crate) serial: u64,
    /// On-disk record currently being fetched.
    pub(crate) address: Address,
    /// Outstanding page-in request.
    pub(crate) io_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    #[test]
    fn submit_and_take() {
        let manager = PageInManager::new(Arc::new(NullDevice::new()));
        let id = manager.submit(0, 24);
        let result = loop {
            if let Some(result) = manager.take(id) {
                break result;
            }
            thread::yield_now();
        };
        let buf = result.unwrap();
        assert_eq!(buf.as_ptr() as usize % 8, 0);
        manager.shutdown();
    }

    #[test]
    fn take_is_one_shot() {
        let manager = PageInManager::new(Arc::new(NullDevice::new()));
        let id = manager.submit(0, 8);
        while manager.take(id).is_none() {
            thread::yield_now();
        }
        assert!(manager.take(id).is_none());
        manager.shutdown();
    }
}
