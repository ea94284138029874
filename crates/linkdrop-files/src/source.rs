//! Send-side file sources.

use crate::error::Result;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// Where the bytes of an outgoing file come from
#[derive(Debug, Clone)]
enum Source {
    Path(PathBuf),
    Memory(Bytes),
}

/// A local file offered to a peer
///
/// Holds only a handle to the bytes; content is streamed when a transfer
/// opens it.
#[derive(Debug, Clone)]
pub struct LocalFile {
    name: String,
    size: u64,
    mime_type: String,
    source: Source,
}

impl LocalFile {
    /// Describe a file on disk.
    ///
    /// The name is the final path component and the size is taken from the
    /// file system.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be stat'ed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = guess_mime_type(&name).to_string();

        Ok(Self {
            name,
            size: metadata.len(),
            mime_type,
            source: Source::Path(path.to_path_buf()),
        })
    }

    /// Describe an in-memory buffer as a file.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
            source: Source::Memory(data),
        }
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// MIME type
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Open a fresh byte stream positioned at the start of the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an on-disk file can no longer be opened.
    pub async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            Source::Path(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            Source::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

/// Best-effort MIME type from a file extension
fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
