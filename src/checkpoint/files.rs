//! Checkpoint artifact files.
//!
//! Layout under the checkpoint directory, one subdirectory per token:
//!
//! ```text
//! <dir>/<token>/index.meta.json   index metadata (JSON)
//! <dir>/<token>/index.bin         bucket image, little-endian u64 words
//! <dir>/<token>/log.meta.json     log metadata (JSON)
//! <dir>/<token>/log.dat           resident pages, head page first
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::index::{HashBucket, IndexImage};

use super::{CheckpointToken, IndexMetadata, LogMetadata};

const WORDS_PER_BUCKET: usize = HashBucket::NUM_ENTRIES + 1;

/// Directory holding one token's artifacts.
pub fn artifact_dir(base: &Path, token: CheckpointToken) -> PathBuf {
    base.join(token.to_string())
}

/// Write the index artifact.
pub fn write_index(base: &Path, meta: &IndexMetadata, image: &IndexImage) -> io::Result<()> {
    let dir = artifact_dir(base, meta.token);
    fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(meta)?;
    fs::write(dir.join("index.meta.json"), json)?;

    let file = File::create(dir.join("index.bin"))?;
    let mut writer = BufWriter::new(file);
    for word in &image.main {
        writer.write_all(&word.to_le_bytes())?;
    }
    for bucket in &image.overflow {
        for word in bucket {
            writer.write_all(&word.to_le_bytes())?;
        }
    }
    writer.into_inner()?.sync_all()
}

/// Read the index artifact back.
pub fn read_index(base: &Path, token: CheckpointToken) -> io::Result<(IndexMetadata, IndexImage)> {
    let dir = artifact_dir(base, token);
    let meta: IndexMetadata = serde_json::from_slice(&fs::read(dir.join("index.meta.json"))?)?;

    let main_words = meta.table_size as usize * WORDS_PER_BUCKET;

    fn read_word(reader: &mut BufReader<File>) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    let file = File::open(dir.join("index.bin"))?;
    let mut reader = BufReader::new(file);

    let mut main = Vec::with_capacity(main_words);
    for _ in 0..main_words {
        main.push(read_word(&mut reader)?);
    }
    let mut overflow = Vec::with_capacity(meta.overflow_count as usize);
    for _ in 0..meta.overflow_count {
        let mut bucket = [0u64; WORDS_PER_BUCKET];
        for word in bucket.iter_mut() {
            *word = read_word(&mut reader)?;
        }
        overflow.push(bucket);
    }
    let table_size = meta.table_size;
    Ok((
        meta,
        IndexImage {
            table_size,
            main,
            overflow,
        },
    ))
}

/// Pages captured for the log artifact, head page first.
pub struct LogPages {
    /// First page in the capture.
    pub first_page: u32,
    /// Page size in bytes.
    pub page_size: usize,
    /// Raw page images, `first_page` first.
    pub pages: Vec<Vec<u8>>,
}

/// Write the log artifact.
pub fn write_log(base: &Path, meta: &LogMetadata, pages: &LogPages) -> io::Result<()> {
    let dir = artifact_dir(base, meta.token);
    fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(meta)?;
    fs::write(dir.join("log.meta.json"), json)?;

    let file = File::create(dir.join("log.dat"))?;
    let mut writer = BufWriter::new(file);
    for page in &pages.pages {
        debug_assert_eq!(page.len(), pages.page_size);
        writer.write_all(page)?;
    }
    writer.into_inner()?.sync_all()
}

/// Read the log artifact back.
pub fn read_log(base: &Path, token: CheckpointToken) -> io::Result<(LogMetadata, LogPages)> {
    let dir = artifact_dir(base, token);
    let meta: LogMetadata = serde_json::from_slice(&fs::read(dir.join("log.meta.json"))?)?;

    let page_size = 1usize << meta.page_size_bits;
    let first_page = crate::address::Address::from_control(meta.head_address).page();
    let last_page = crate::address::Address::from_control(meta.checkpoint_tail).page();

    let file = File::open(dir.join("log.dat"))?;
    let mut reader = BufReader::new(file);
    let mut pages = Vec::new();
    for _ in first_page..=last_page {
        let mut page = vec![0u8; page_size];
        reader.read_exact(&mut page)?;
        pages.push(page);
    }

    Ok((
        meta,
        LogPages {
            first_page,
            page_size,
            pages,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use uuid::Uuid;

    #[test]
    fn index_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let meta = IndexMetadata {
            token,
            version: 2,
            table_size: 4,
            overflow_count: 1,
            checkpoint_start: Address::new(1, 512).control(),
        };
        let image = IndexImage {
            table_size: 4,
            main: (0..32u64).collect(),
            overflow: vec![[9u64; 8]],
        };
        write_index(dir.path(), &meta, &image).unwrap();
        let (meta2, image2) = read_index(dir.path(), token).unwrap();
        assert_eq!(meta2.table_size, 4);
        assert_eq!(meta2.checkpoint_start, meta.checkpoint_start);
        assert_eq!(image2.table_size, 4);
        assert_eq!(image2.main, image.main);
        assert_eq!(image2.overflow, image.overflow);
    }

    #[test]
    fn log_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let meta = LogMetadata {
            token,
            version: 1,
            page_size_bits: 12,
            begin_address: 0,
            head_address: Address::new(0, 0).control(),
            checkpoint_tail: Address::new(1, 100).control(),
            sessions: vec![super::super::SessionSnapshot {
                guid: Uuid::new_v4(),
                serial: 41,
            }],
        };
        let pages = LogPages {
            first_page: 0,
            page_size: 4096,
            pages: vec![vec![1u8; 4096], vec![2u8; 4096]],
        };
        write_log(dir.path(), &meta, &pages).unwrap();
        let (meta2, pages2) = read_log(dir.path(), token).unwrap();
        assert_eq!(meta2.sessions.len(), 1);
        assert_eq!(meta2.sessions[0].serial, 41);
        assert_eq!(pages2.pages.len(), 2);
        assert_eq!(pages2.pages[0][0], 1);
        assert_eq!(pages2.pages[1][0], 2);
    }

    #[test]
    fn missing_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_index(dir.path(), Uuid::new_v4()).is_err());
    }
}
