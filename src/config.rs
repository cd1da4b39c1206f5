//! Store configuration.

use std::path::PathBuf;

use crate::address::Address;
use crate::status::Status;
use crate::utility::is_power_of_two;

/// Configuration for [`crate::TideKv`].
#[derive(Debug, Clone)]
pub struct TideKvConfig {
    /// Hash index bucket count; must be a power of two.
    pub table_size: u64,
    /// In-memory log capacity in bytes; a multiple of the page size and at
    /// least two pages.
    pub log_memory_size: u64,
    /// Page size exponent (page size = `1 << page_size_bits`).
    pub page_size_bits: u32,
    /// Fraction of resident pages kept in the mutable region.
    pub mutable_fraction: f64,
    /// Directory for checkpoint artifacts. Checkpoint and recover return
    /// `InvalidOperation` when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl TideKvConfig {
    /// Configuration with the given index size and log budget.
    pub fn new(table_size: u64, log_memory_size: u64) -> Self {
        Self {
            table_size,
            log_memory_size,
            ..Self::default()
        }
    }

    /// Set the checkpoint directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Set the page size exponent.
    pub fn with_page_size_bits(mut self, bits: u32) -> Self {
        self.page_size_bits = bits;
        self
    }

    /// Set the mutable fraction.
    pub fn with_mutable_fraction(mut self, fraction: f64) -> Self {
        self.mutable_fraction = fraction;
        self
    }

    /// Validate the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), Status> {
        if !is_power_of_two(self.table_size) {
            return Err(Status::InvalidArgument);
        }
        if self.page_size_bits < 6 || self.page_size_bits > Address::OFFSET_BITS {
            return Err(Status::InvalidArgument);
        }
        let page_size = 1u64 << self.page_size_bits;
        if self.log_memory_size < 2 * page_size || self.log_memory_size % page_size != 0 {
            return Err(Status::InvalidArgument);
        }
        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for TideKvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            log_memory_size: 1 << 28, // 256 MiB
            page_size_bits: 22,       // 4 MiB pages
            mutable_fraction: 0.9,
            checkpoint_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(TideKvConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_table_size() {
        let config = TideKvConfig::new(100, 1 << 28);
        assert_eq!(config.validate(), Err(Status::InvalidArgument));
    }

    #[test]
    fn rejects_undersized_log() {
        let config = TideKvConfig::new(128, 1 << 22).with_page_size_bits(22);
        assert_eq!(config.validate(), Err(Status::InvalidArgument));
    }

    #[test]
    fn rejects_unaligned_log_size() {
        let config = TideKvConfig {
            table_size: 128,
            log_memory_size: (1 << 22) * 2 + 1,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(Status::InvalidArgument));
    }
}
