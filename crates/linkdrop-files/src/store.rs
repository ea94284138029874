//! File store capability.
//!
//! A store keeps two regions per entry: a metadata row ([`FileRecord`]) and
//! an ordered sequence of byte pages numbered from zero. Pages are appended
//! strictly in order and read back by sequence number.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(FileId)
    }
}

/// Metadata for an entry about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    /// File name as announced by the sender
    pub name: String,
    /// Announced size in bytes
    pub size: u64,
    /// MIME type as announced by the sender
    pub mime_type: String,
    /// Public id of the client the file came from
    pub owner: String,
}

/// Stored metadata row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Entry id
    pub id: FileId,
    /// File name
    pub name: String,
    /// Announced size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at: u64,
    /// Public id of the client the file came from
    pub owner: String,
    /// Set once, together with the final page
    pub transferred: bool,
}

impl FileRecord {
    pub(crate) fn from_new(id: FileId, file: NewFile, created_at: u64) -> Self {
        Self {
            id,
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            created_at,
            owner: file.owner,
            transferred: false,
        }
    }
}

/// Newest first; ties broken by the later id
pub(crate) fn sort_newest_first(records: &mut [FileRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Persistent chunked file store
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Allocate one metadata row per file, all with `transferred = false`.
    ///
    /// Ids are returned in input order.
    async fn create_entries(&self, files: Vec<NewFile>) -> Result<Vec<FileId>>;

    /// Committed entries, most recently created first.
    async fn list(&self) -> Result<Vec<FileRecord>>;

    /// Metadata for one entry, committed or not.
    async fn get(&self, id: FileId) -> Result<FileRecord>;

    /// Append page `seq` to an uncommitted entry.
    ///
    /// `seq` must equal the number of pages already stored.
    async fn append_page(&self, id: FileId, seq: u64, page: Bytes) -> Result<()>;

    /// Store the final page (if any) and mark the entry transferred, as one
    /// atomic step.
    async fn commit(&self, id: FileId, last_page: Option<(u64, Bytes)>) -> Result<()>;

    /// Read page `seq`; `None` past the last page.
    async fn read_page(&self, id: FileId, seq: u64) -> Result<Option<Bytes>>;

    /// Remove an entry's metadata and all of its pages.
    async fn delete_entry(&self, id: FileId) -> Result<()>;

    /// Remove several entries independently.
    ///
    /// Every id gets its own result; a failure for one id does not stop the
    /// others from being deleted.
    async fn delete_entries(&self, ids: &[FileId]) -> Vec<(FileId, Result<()>)> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let result = self.delete_entry(id).await;
            if let Err(e) = &result {
                tracing::warn!("Failed to delete file entry {}: {}", id, e);
            }
            results.push((id, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, created_at: u64) -> FileRecord {
        FileRecord::from_new(
            FileId(id),
            NewFile {
                name: format!("f{id}"),
                size: 0,
                mime_type: String::new(),
                owner: "peer".to_string(),
            },
            created_at,
        )
    }

    #[test]
    fn test_newest_first_with_tie_break() {
        let mut records = vec![record(1, 100), record(2, 300), record(3, 100)];
        sort_newest_first(&mut records);
        let ids: Vec<u64> = records.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record(5, 42)).unwrap();
        assert_eq!(json["id"], 5);
        assert_eq!(json["createdAt"], 42);
        assert_eq!(json["type"], "");
        assert_eq!(json["transferred"], false);
    }

    #[test]
    fn test_file_id_parse() {
        assert_eq!("12".parse::<FileId>().unwrap(), FileId(12));
        assert!("x".parse::<FileId>().is_err());
    }
}
