//! Sequential page reader with a resumable cursor.

use crate::error::Result;
use crate::store::{FileId, FileRecord, FileStore};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Pull source over one storage entry
///
/// The cursor is the next page sequence number. Pausing is simply not
/// calling [`FileReader::next_page`]; a reader can also be dropped and later
/// recreated from [`FileReader::cursor`] with [`FileReader::resume`].
pub struct FileReader {
    store: Arc<dyn FileStore>,
    record: FileRecord,
    cursor: u64,
    done: bool,
}

impl FileReader {
    /// Open a reader at the first page.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] for an unknown id.
    pub async fn open(store: Arc<dyn FileStore>, id: FileId) -> Result<Self> {
        Self::resume(store, id, 0).await
    }

    /// Open a reader positioned at page `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] for an unknown id.
    pub async fn resume(store: Arc<dyn FileStore>, id: FileId, cursor: u64) -> Result<Self> {
        let record = store.get(id).await?;
        Ok(Self {
            store,
            record,
            cursor,
            done: false,
        })
    }

    /// Metadata of the entry being read
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Sequence number of the next page to be returned
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next page in order, or `None` at the end.
    pub async fn next_page(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.store.read_page(self.record.id, self.cursor).await? {
            Some(page) => {
                self.cursor += 1;
                Ok(Some(page))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Read every remaining page into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let capacity = usize::try_from(self.record.size).unwrap_or(0);
        let mut out = Vec::with_capacity(capacity);
        while let Some(page) = self.next_page().await? {
            out.extend_from_slice(&page);
        }
        Ok(out)
    }

    /// Stream every remaining page into `sink`, one page at a time.
    ///
    /// Returns the number of bytes written.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        while let Some(page) = self.next_page().await? {
            sink.write_all(&page).await?;
            total += page.len() as u64;
        }
        sink.flush().await?;
        Ok(total)
    }
}
