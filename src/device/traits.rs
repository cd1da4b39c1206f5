//! Device traits.
//!
//! The engine drives devices through the async [`StorageDevice`] interface
//! (the pending-I/O worker awaits reads on its own runtime); simple devices
//! implement the synchronous [`SyncStorageDevice`] trait and pick up the
//! async interface through the blanket impl.

use std::future::Future;
use std::io;
use std::pin::Pin;

/// Asynchronous storage device.
///
/// Offsets are raw byte positions; the hybrid log writes each page at
/// `page * page_size`.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + '_>>;

    /// Write `buf` at `offset`.
    fn write(
        &self,
        offset: u64,
        buf: &[u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + '_>>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>>;

    /// Current device size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Required I/O alignment.
    fn alignment(&self) -> usize {
        512
    }
}

/// Synchronous storage device; the blanket impl lifts it to
/// [`StorageDevice`].
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`.
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered writes.
    fn flush_sync(&self) -> io::Result<()>;

    /// Current device size in bytes.
    fn size_sync(&self) -> io::Result<u64>;

    /// Required I/O alignment.
    fn alignment(&self) -> usize {
        512
    }
}

impl<T: SyncStorageDevice> StorageDevice for T {
    fn read(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + '_>> {
        let result = self.read_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn write(
        &self,
        offset: u64,
        buf: &[u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + '_>> {
        let result = self.write_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
        let result = self.flush_sync();
        Box::pin(async move { result })
    }

    fn size(&self) -> io::Result<u64> {
        self.size_sync()
    }

    fn alignment(&self) -> usize {
        SyncStorageDevice::alignment(self)
    }
}
