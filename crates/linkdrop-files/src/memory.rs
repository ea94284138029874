//! In-memory file store.

use crate::error::{Result, StorageError};
use crate::store::{FileId, FileRecord, FileStore, NewFile, sort_newest_first};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry {
    record: FileRecord,
    pages: Vec<Bytes>,
}

/// File store held entirely in memory
///
/// Each entry lives behind one map shard lock, so `commit` stores the final
/// page and flips `transferred` without any interleaving reader.
#[derive(Default)]
pub struct MemoryFileStore {
    entries: DashMap<FileId, Entry>,
    next_id: AtomicU64,
}

impl MemoryFileStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, committed or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push_page(entry: &mut Entry, seq: u64, page: Bytes) -> Result<()> {
        let expected = entry.pages.len() as u64;
        if seq != expected {
            return Err(StorageError::OutOfOrder {
                id: entry.record.id,
                expected,
                actual: seq,
            });
        }
        entry.pages.push(page);
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn create_entries(&self, files: Vec<NewFile>) -> Result<Vec<FileId>> {
        let created_at = crate::now_millis();
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            let record = FileRecord::from_new(id, file, created_at);
            self.entries.insert(
                id,
                Entry {
                    record,
                    pages: Vec::new(),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .entries
            .iter()
            .filter(|e| e.record.transferred)
            .map(|e| e.record.clone())
            .collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, id: FileId) -> Result<FileRecord> {
        self.entries
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or(StorageError::NotFound(id))
    }

    async fn append_page(&self, id: FileId, seq: u64, page: Bytes) -> Result<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if entry.record.transferred {
            return Err(StorageError::AlreadyCommitted(id));
        }
        Self::push_page(&mut entry, seq, page)
    }

    async fn commit(&self, id: FileId, last_page: Option<(u64, Bytes)>) -> Result<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if entry.record.transferred {
            return Err(StorageError::AlreadyCommitted(id));
        }
        if let Some((seq, page)) = last_page {
            Self::push_page(&mut entry, seq, page)?;
        }
        entry.record.transferred = true;
        Ok(())
    }

    async fn read_page(&self, id: FileId, seq: u64) -> Result<Option<Bytes>> {
        let entry = self.entries.get(&id).ok_or(StorageError::NotFound(id))?;
        let page = usize::try_from(seq)
            .ok()
            .and_then(|i| entry.pages.get(i))
            .cloned();
        Ok(page)
    }

    async fn delete_entry(&self, id: FileId) -> Result<()> {
        self.entries
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }
}
