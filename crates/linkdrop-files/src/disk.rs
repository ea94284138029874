//! On-disk file store.
//!
//! Layout under the store root:
//!
//! ```text
//! meta/<id>.json        metadata row
//! data/<id>/<seq>.page  byte pages
//! ```
//!
//! Metadata is replaced by writing a temporary file and renaming it over the
//! old one. The commit writes the final page first and then renames the
//! updated metadata, so an entry is only ever listed with all pages present.
//! Deletion hides the entry, removes its pages and only then drops the
//! metadata, so a failed delete can be retried.
//!
//! Writes to one entry are serialized by a per-entry lock holding the next
//! page number; entries never wait on each other.

use crate::error::{Result, StorageError};
use crate::store::{FileId, FileRecord, FileStore, NewFile, sort_newest_first};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

const META_DIR: &str = "meta";
const DATA_DIR: &str = "data";

/// Next page number of an entry, counted from disk on first use
type PageCursor = Arc<Mutex<Option<u64>>>;

/// File store backed by a directory tree
pub struct DiskFileStore {
    root: PathBuf,
    /// Next id to allocate
    next_id: AtomicU64,
    /// Per-entry write locks
    cursors: DashMap<FileId, PageCursor>,
}

impl DiskFileStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Existing metadata is scanned to continue the id sequence.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created or read.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(META_DIR)).await?;
        fs::create_dir_all(root.join(DATA_DIR)).await?;

        let mut max_id = 0;
        let mut dir = fs::read_dir(root.join(META_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(id) = parse_meta_name(&entry.file_name().to_string_lossy()) {
                max_id = max_id.max(id);
            }
        }

        tracing::debug!(
            "Opened file store at {} (next id {})",
            root.display(),
            max_id + 1
        );
        Ok(Self {
            root,
            next_id: AtomicU64::new(max_id + 1),
            cursors: DashMap::new(),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, id: FileId) -> PathBuf {
        self.root.join(META_DIR).join(format!("{id}.json"))
    }

    fn data_dir(&self, id: FileId) -> PathBuf {
        self.root.join(DATA_DIR).join(id.to_string())
    }

    fn page_path(&self, id: FileId, seq: u64) -> PathBuf {
        self.data_dir(id).join(format!("{seq}.page"))
    }

    fn cursor(&self, id: FileId) -> PageCursor {
        Arc::clone(self.cursors.entry(id).or_default().value())
    }

    async fn read_meta(&self, id: FileId) -> Result<FileRecord> {
        match fs::read(self.meta_path(id)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, record: &FileRecord) -> Result<()> {
        let path = self.meta_path(record.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn page_count(&self, id: FileId) -> Result<u64> {
        let mut count = 0;
        let mut dir = match fs::read_dir(self.data_dir(id)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while dir.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Write page `seq`; `next` is the entry's locked cursor
    async fn write_page(
        &self,
        id: FileId,
        next: &mut Option<u64>,
        seq: u64,
        page: &[u8],
    ) -> Result<()> {
        let expected = match *next {
            Some(expected) => expected,
            None => self.page_count(id).await?,
        };
        *next = Some(expected);
        if seq != expected {
            return Err(StorageError::OutOfOrder {
                id,
                expected,
                actual: seq,
            });
        }
        fs::write(self.page_path(id, seq), page).await?;
        *next = Some(expected + 1);
        Ok(())
    }

    /// Hide the entry, then drop its pages, then its metadata
    async fn delete_locked(&self, id: FileId) -> Result<()> {
        let mut record = self.read_meta(id).await?;
        if record.transferred {
            record.transferred = false;
            self.write_meta(&record).await?;
        }
        match fs::remove_dir_all(self.data_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.meta_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_meta_name(name: &str) -> Option<u64> {
    name.strip_suffix(".json")?.parse().ok()
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn create_entries(&self, files: Vec<NewFile>) -> Result<Vec<FileId>> {
        let created_at = crate::now_millis();
        let mut ids = Vec::with_capacity(files.len());

        for file in files {
            let id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let record = FileRecord::from_new(id, file, created_at);
            fs::create_dir_all(self.data_dir(id)).await?;
            self.write_meta(&record).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        let mut dir = fs::read_dir(self.root.join(META_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(id) = parse_meta_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            match self.read_meta(FileId(id)).await {
                Ok(record) if record.transferred => records.push(record),
                Ok(_) => {}
                // Deleted between read_dir and read
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, id: FileId) -> Result<FileRecord> {
        self.read_meta(id).await
    }

    async fn append_page(&self, id: FileId, seq: u64, page: Bytes) -> Result<()> {
        let cursor = self.cursor(id);
        let mut next = cursor.lock().await;
        if self.read_meta(id).await?.transferred {
            return Err(StorageError::AlreadyCommitted(id));
        }
        self.write_page(id, &mut next, seq, &page).await
    }

    async fn commit(&self, id: FileId, last_page: Option<(u64, Bytes)>) -> Result<()> {
        let cursor = self.cursor(id);
        let mut next = cursor.lock().await;
        let mut record = self.read_meta(id).await?;
        if record.transferred {
            return Err(StorageError::AlreadyCommitted(id));
        }
        if let Some((seq, page)) = last_page {
            self.write_page(id, &mut next, seq, &page).await?;
        }
        record.transferred = true;
        self.write_meta(&record).await?;
        drop(next);
        self.cursors.remove(&id);
        Ok(())
    }

    async fn read_page(&self, id: FileId, seq: u64) -> Result<Option<Bytes>> {
        match fs::read(self.page_path(id, seq)).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Distinguish "past the end" from "no such entry"
                self.read_meta(id).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_entry(&self, id: FileId) -> Result<()> {
        let cursor = self.cursor(id);
        let guard = cursor.lock().await;
        let result = self.delete_locked(id).await;
        drop(guard);
        self.cursors.remove(&id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_file(name: &str) -> NewFile {
        NewFile {
            name: name.to_string(),
            size: 4,
            mime_type: "application/octet-stream".to_string(),
            owner: "peer-b".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_commit_list() {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::open(dir.path()).await.unwrap();

        let ids = store
            .create_entries(vec![new_file("x.bin"), new_file("y.bin")])
            .await
            .unwrap();
        assert_eq!(ids, vec![FileId(1), FileId(2)]);
        assert!(store.list().await.unwrap().is_empty());

        store
            .append_page(ids[0], 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        store
            .commit(ids[0], Some((1, Bytes::from_static(b"cd"))))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ids[0]);
        assert_eq!(
            store.read_page(ids[0], 1).await.unwrap().as_deref(),
            Some(&b"cd"[..])
        );
        assert_eq!(store.read_page(ids[0], 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_continues_ids() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskFileStore::open(dir.path()).await.unwrap();
            store
                .create_entries(vec![new_file("a"), new_file("b")])
                .await
                .unwrap();
        }
        let store = DiskFileStore::open(dir.path()).await.unwrap();
        let ids = store.create_entries(vec![new_file("c")]).await.unwrap();
        assert_eq!(ids, vec![FileId(3)]);
    }

    #[tokio::test]
    async fn test_delete_removes_pages() {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::open(dir.path()).await.unwrap();
        let id = store.create_entries(vec![new_file("a")]).await.unwrap()[0];
        store
            .commit(id, Some((0, Bytes::from_static(b"data"))))
            .await
            .unwrap();

        store.delete_entry(id).await.unwrap();
        assert!(store.get(id).await.unwrap_err().is_not_found());
        assert!(store.read_page(id, 0).await.unwrap_err().is_not_found());
        assert!(!store.data_dir(id).exists());
        assert!(store.delete_entry(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_out_of_order_page_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::open(dir.path()).await.unwrap();
        let id = store.create_entries(vec![new_file("a")]).await.unwrap()[0];
        let err = store
            .append_page(id, 1, Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { expected: 0, .. }));
    }

    #[tokio::test]
    async fn test_page_cursor_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = DiskFileStore::open(dir.path()).await.unwrap();
            let id = store.create_entries(vec![new_file("a")]).await.unwrap()[0];
            store.append_page(id, 0, Bytes::from_static(b"ab")).await.unwrap();
            id
        };

        let store = DiskFileStore::open(dir.path()).await.unwrap();
        store.append_page(id, 1, Bytes::from_static(b"cd")).await.unwrap();
        let err = store
            .append_page(id, 3, Bytes::from_static(b"ef"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { expected: 2, actual: 3, .. }));
        store.commit(id, Some((2, Bytes::from_static(b"ef")))).await.unwrap();
        assert_eq!(store.page_count(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_entries_are_written_independently() {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::open(dir.path()).await.unwrap();
        let ids = store
            .create_entries(vec![new_file("x"), new_file("y")])
            .await
            .unwrap();

        let write = |id: FileId, fill: u8| {
            let store = &store;
            async move {
                for seq in 0..20u64 {
                    store
                        .append_page(id, seq, Bytes::from(vec![fill; 8]))
                        .await
                        .unwrap();
                }
                store.commit(id, None).await.unwrap();
            }
        };
        tokio::join!(write(ids[0], 1), write(ids[1], 2));

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(
            store.read_page(ids[1], 19).await.unwrap().as_deref(),
            Some(&[2u8; 8][..])
        );
        assert!(store.cursors.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry_for_retry() {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::open(dir.path()).await.unwrap();
        let id = store.create_entries(vec![new_file("a")]).await.unwrap()[0];
        store
            .commit(id, Some((0, Bytes::from_static(b"data"))))
            .await
            .unwrap();

        // A plain file where the page directory should be
        let data = store.data_dir(id);
        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, b"blocker").unwrap();

        assert!(store.delete_entry(id).await.is_err());
        // Hidden from listings but still addressable
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.get(id).await.unwrap().transferred);

        std::fs::remove_file(&data).unwrap();
        store.delete_entry(id).await.unwrap();
        assert!(store.get(id).await.unwrap_err().is_not_found());
    }
}
