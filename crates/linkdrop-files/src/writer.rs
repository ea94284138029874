//! Sequential page writer.

use crate::error::Result;
use crate::store::{FileId, FileStore};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;

/// Append sink for one storage entry
///
/// Incoming bytes are buffered into commit pages of `page_size` bytes. Each
/// full page is appended as soon as it fills; [`FileWriter::finish`] stores
/// the remainder and marks the entry transferred in the same store call.
pub struct FileWriter {
    store: Arc<dyn FileStore>,
    id: FileId,
    page_size: usize,
    buffer: BytesMut,
    next_seq: u64,
    written: u64,
}

impl FileWriter {
    /// Open a writer for an entry created with
    /// [`FileStore::create_entries`].
    ///
    /// A zero `page_size` is treated as one byte.
    pub fn new(store: Arc<dyn FileStore>, id: FileId, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            store,
            id,
            page_size,
            buffer: BytesMut::with_capacity(page_size),
            next_seq: 0,
            written: 0,
        }
    }

    /// Entry being written
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Total bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Accept a chunk of any size, flushing every page that fills up.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the writer should then be aborted.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        self.written += data.len() as u64;
        while !data.is_empty() {
            let room = self.page_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.put_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.page_size {
                let page = self.buffer.split().freeze();
                self.store.append_page(self.id, self.next_seq, page).await?;
                tracing::trace!("Flushed page {} of entry {}", self.next_seq, self.id);
                self.next_seq += 1;
                self.buffer.reserve(self.page_size);
            }
        }
        Ok(())
    }

    /// Store the buffered remainder and mark the entry transferred.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the entry then stays uncommitted.
    pub async fn finish(mut self) -> Result<u64> {
        let last = (!self.buffer.is_empty()).then(|| (self.next_seq, self.buffer.split().freeze()));
        self.store.commit(self.id, last).await?;
        tracing::debug!(
            "Committed entry {} ({} bytes)",
            self.id,
            self.written
        );
        Ok(self.written)
    }

    /// Discard everything written and delete the entry.
    ///
    /// # Errors
    ///
    /// Propagates the store's delete failure.
    pub async fn abort(self) -> Result<()> {
        tracing::debug!("Aborting entry {} after {} bytes", self.id, self.written);
        self.store.delete_entry(self.id).await
    }
}
