//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::page::PAGE_SIZE;

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; each database lives in its own subdirectory.
    pub data_dir: PathBuf,
    /// Buffer pool size in number of page frames.
    pub buffer_pool_pages: usize,
    /// Number of committed transactions between automatic checkpoints
    /// (0 = only checkpoint on shutdown).
    pub checkpoint_interval_txns: u32,
    /// Enable fsync on WAL flush. Disabled only by tests that do not
    /// exercise durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_pages: 256,
            checkpoint_interval_txns: 64,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.buffer_pool_pages, 256);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_pool_size_bytes() {
        let config = StorageConfig {
            buffer_pool_pages: 128,
            ..Default::default()
        };
        assert_eq!(config.buffer_pool_size_bytes(), 128 * PAGE_SIZE);
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.buffer_pool_pages, deserialized.buffer_pool_pages);
    }
}
