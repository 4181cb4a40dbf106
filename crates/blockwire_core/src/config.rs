//! Log configuration.

use blockwire_codec::DEFAULT_BLOCK_SIZE;

/// Highest log format version this build reads and the version it writes.
pub const FORMAT_VERSION: u64 = 1;

/// Configuration for opening a [`BlockChain`](crate::BlockChain).
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Size of the pooled blocks used to read and write records.
    pub block_size: usize,

    /// Whether to sync the backend after every append (safer but slower).
    pub sync_on_append: bool,

    /// Append a block boundary after this many records (0 = never).
    pub records_per_block: u64,

    /// Whether to truncate an incomplete final record on open.
    pub repair_torn_tail: bool,

    /// Format version written into the header of new logs.
    pub format_version: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            sync_on_append: true,
            records_per_block: 0,
            repair_torn_tail: true,
            format_version: FORMAT_VERSION,
        }
    }
}

impl ChainConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pooled block size.
    #[must_use]
    pub const fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets whether to sync after every append.
    #[must_use]
    pub const fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }

    /// Sets the automatic block boundary interval.
    #[must_use]
    pub const fn records_per_block(mut self, count: u64) -> Self {
        self.records_per_block = count;
        self
    }

    /// Sets whether to repair a torn tail on open.
    #[must_use]
    pub const fn repair_torn_tail(mut self, value: bool) -> Self {
        self.repair_torn_tail = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChainConfig::default();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.sync_on_append);
        assert!(config.repair_torn_tail);
        assert_eq!(config.records_per_block, 0);
        assert_eq!(config.format_version, FORMAT_VERSION);
    }

    #[test]
    fn builder_pattern() {
        let config = ChainConfig::new()
            .block_size(64)
            .sync_on_append(false)
            .records_per_block(10)
            .repair_torn_tail(false);

        assert_eq!(config.block_size, 64);
        assert!(!config.sync_on_append);
        assert_eq!(config.records_per_block, 10);
        assert!(!config.repair_torn_tail);
    }
}
