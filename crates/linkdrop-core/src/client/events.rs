//! Client events

use super::profile::TrustedPeer;
use crate::protocol::FileOffer;
use linkdrop_files::FileId;
use linkdrop_registry::PublicId;

/// Which way a file is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We are serving the file
    Send,
    /// We are storing the file
    Receive,
}

/// Lifecycle step of one file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// The data channel for the file is open
    Opened,
    /// Bytes moved so far
    Progress {
        /// Bytes sent or received
        bytes: u64,
        /// Announced size
        total: u64,
    },
    /// Transfer finished; receivers get the storage entry id
    Completed {
        /// Stored entry (receive side only)
        file_id: Option<FileId>,
    },
    /// Transfer failed
    Failed {
        /// Human-readable cause
        reason: String,
        /// Whether an idle or open timeout fired
        timed_out: bool,
    },
}

/// Progress of one file with one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// Remote client
    pub peer: PublicId,
    /// File name
    pub file: String,
    /// Send or receive
    pub direction: Direction,
    /// What happened
    pub status: TransferStatus,
}

impl TransferEvent {
    /// Whether this is the last event for the file
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed { .. } | TransferStatus::Failed { .. }
        )
    }
}

/// Everything a client reports to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A handshake completed
    PeerConnected(TrustedPeer),
    /// A peer was removed from the trusted set
    PeerDisconnected(PublicId),
    /// A peer announced files
    FilesOffered {
        /// Offering client
        peer: PublicId,
        /// Offered files
        files: Vec<FileOffer>,
    },
    /// A file transfer changed state
    Transfer(TransferEvent),
}
