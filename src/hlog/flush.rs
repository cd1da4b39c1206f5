//! Background flush worker.
//!
//! Closed pages are flushed to the device off the operation threads: drain
//! actions enqueue a flush target and the worker (which owns a small tokio
//! runtime for the async device interface) writes pages in order, advancing
//! `flushed_until` as each page lands.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::address::Address;
use crate::device::StorageDevice;

use super::HybridLog;

pub(crate) enum FlushJob {
    /// Flush all whole pages below `upto`.
    FlushTo(Address),
    Shutdown,
}

pub(crate) struct FlushWorker {
    tx: Sender<FlushJob>,
    handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlushWorker {
    pub(crate) fn spawn<D: StorageDevice>(log: Weak<HybridLog<D>>) -> Self {
        let (tx, rx) = unbounded::<FlushJob>();
        let handle = thread::Builder::new()
            .name("tidekv-flush".into())
            .spawn(move || run(rx, log))
            .expect("spawn flush worker");
        Self {
            tx,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn request_flush_to(&self, upto: Address) {
        // A send failure means the worker exited (engine shutting down).
        let _ = self.tx.send(FlushJob::FlushTo(upto));
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(FlushJob::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run<D: StorageDevice>(rx: Receiver<FlushJob>, log: Weak<HybridLog<D>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::warn!(error = %e, "flush worker failed to build runtime");
            return;
        }
    };

    // Pages below this have already been written out.
    let mut next_page: u32 = 0;

    while let Ok(job) = rx.recv() {
        let upto = match job {
            FlushJob::FlushTo(addr) => addr,
            FlushJob::Shutdown => break,
        };
        let Some(log) = log.upgrade() else { break };

        // Only whole closed pages are written; a target mid-page (a freeze
        // at the tail) leaves its partial page for a later request.

        // Recovery seeds flushed_until past the restored pages; never
        // rewrite below it, the ring slots may have been recycled since.
        next_page = next_page.max(log.flushed_until.load(Ordering::Acquire).page());

        while next_page < upto.page() {
            let page = next_page;
            let page_size = log.page_size();
            // SAFETY: the page is closed (below read_only) and cannot be
            // recycled until head passes it, which requires flushed_until to
            // advance first; this worker is the only thing advancing it.
            let bytes = unsafe {
                std::slice::from_raw_parts(log.slot_for(page).base_ptr(), page_size)
            };
            let offset = page as u64 * page_size as u64;
            let result = runtime.block_on(async {
                log.device().write(offset, bytes).await?;
                log.device().flush().await
            });
            match result {
                Ok(()) => {
                    next_page += 1;
                    log.flushed_until
                        .advance_to(Address::new(next_page, 0));
                }
                Err(e) => {
                    tracing::warn!(page, error = %e, "page flush failed");
                    log.flush_failed.store(true, Ordering::Release);
                    // Skip the rest of this request; a later request will
                    // retry from the same page.
                    break;
                }
            }
        }
    }
}
