//! File-backed storage device.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// A device backed by a single file. The file handle is mutex-protected;
/// log flushes and page-ins are rare enough that a single handle suffices.
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDevice {
    /// Open (creating if needed) the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl super::SyncStorageDevice for FileDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        // The log may read a full page of which only a prefix was ever
        // written; treat EOF as zeros.
        while read < buf.len() {
            match file.read(&mut buf[read..])? {
                0 => {
                    buf[read..].fill(0);
                    return Ok(buf.len());
                }
                n => read += n,
            }
        }
        Ok(read)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyncStorageDevice;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::open(dir.path().join("log.dat")).unwrap();

        device.write_sync(4096, b"hello hybrid log").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(device.read_sync(4096, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"hello hybrid log");
    }

    #[test]
    fn short_reads_past_eof_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::open(dir.path().join("log.dat")).unwrap();
        device.write_sync(0, b"abc").unwrap();

        let mut buf = [0xFFu8; 8];
        assert_eq!(device.read_sync(0, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }
}
