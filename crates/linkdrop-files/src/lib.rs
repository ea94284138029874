//! # linkdrop Files
//!
//! Chunked storage for received files.
//!
//! This crate provides:
//! - The [`FileStore`] capability: metadata rows plus ordered byte pages
//! - [`FileWriter`], which batches an incoming byte stream into fixed-size
//!   commit pages and flips the entry to `transferred` with the final page
//! - [`FileReader`], a sequential page reader with a resumable cursor
//! - [`MemoryFileStore`] and [`DiskFileStore`] implementations
//! - [`LocalFile`], the send-side view of a file on disk or in memory
//!
//! ## Visibility
//!
//! An entry is invisible to [`FileStore::list`] until it has been committed.
//! The commit writes the last page and marks the entry transferred as one
//! step, so a reader never observes a listed entry with missing pages.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod disk;
pub mod error;
pub mod memory;
pub mod reader;
pub mod source;
pub mod store;
pub mod writer;

pub use config::StorageConfig;
pub use disk::DiskFileStore;
pub use error::{Result, StorageError};
pub use memory::MemoryFileStore;
pub use reader::FileReader;
pub use source::LocalFile;
pub use store::{FileId, FileRecord, FileStore, NewFile};
pub use writer::FileWriter;

/// Default commit page size (256 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 256 * 1024;

/// Milliseconds since the Unix epoch, used for `created_at` stamps
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
