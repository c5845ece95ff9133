use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Capacity limits of a [`StorageTable`](crate::StorageTable).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of committed files.
    pub max_files: usize,
    /// Maximum number of bytes held by committed files.
    pub max_bytes: u64,
    /// Maximum number of clients that may hold one file open at once.
    pub max_openers_per_file: usize,
    pub max_pathname_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_bytes: 64 * 1024 * 1024,
            max_openers_per_file: 16,
            max_pathname_len: 4096,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_files == 0 {
            return Err(StoreError::InvalidArgument(
                "max_files must be greater than zero".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(StoreError::InvalidArgument(
                "max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_openers_per_file == 0 {
            return Err(StoreError::InvalidArgument(
                "max_openers_per_file must be greater than zero".to_string(),
            ));
        }
        if self.max_pathname_len == 0 {
            return Err(StoreError::InvalidArgument(
                "max_pathname_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
