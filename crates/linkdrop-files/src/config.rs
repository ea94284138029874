//! Storage configuration.

use crate::error::{Result, StorageError};
use crate::DEFAULT_PAGE_SIZE;

/// Largest accepted commit page (16 MiB)
const MAX_PAGE_SIZE: usize = 16 * 1024 * 1024;

/// Chunked storage configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Bytes buffered per commit page
    pub page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl StorageConfig {
    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfig`] if the page size is zero or
    /// larger than 16 MiB.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StorageError::InvalidConfig(
                "page_size must be greater than 0".to_string(),
            ));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page_size must be at most {MAX_PAGE_SIZE} bytes"
            )));
        }
        Ok(())
    }
}
