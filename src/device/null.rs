//! Discard device: writes vanish, reads return zeros. Backs purely
//! in-memory stores and benchmarks.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::SyncStorageDevice;

/// A device that discards all data.
#[derive(Debug, Default)]
pub struct NullDevice {
    size: AtomicU64,
}

impl NullDevice {
    /// Create a discard device.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStorageDevice for NullDevice {
    fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let end = offset + buf.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_zero() {
        let device = NullDevice::new();
        let mut buf = [0xFFu8; 64];
        assert_eq!(device.read_sync(0, &mut buf).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_grow_the_logical_size() {
        let device = NullDevice::new();
        device.write_sync(100, &[1u8; 50]).unwrap();
        assert_eq!(device.size_sync().unwrap(), 150);
        device.write_sync(0, &[1u8; 10]).unwrap();
        assert_eq!(device.size_sync().unwrap(), 150);
    }
}
