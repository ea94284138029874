//! # linkdrop Core
//!
//! Peer-to-peer file transfer engine for linkdrop.
//!
//! This crate provides:
//! - Control messages and their JSON wire shape
//! - A dispatcher with middleware chains and correlated waits
//! - The relay and direct-link capabilities, with in-process implementations
//! - The [`Client`]: link-code handshakes, trust, peer sessions and
//!   chunked file transfers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Client                                  │
//! │   (trust, sessions, transfers, profile persistence)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Dispatcher                                │
//! │   (typed send/receive bus, auth middleware, correlated waits)   │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │            Relay             │           Peer links             │
//! │   (signaling, per-pair FIFO) │   (named data channels)          │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod protocol;
pub mod relay;

pub use client::{
    Client, ClientConfig, ClientEvent, Collaborators, Direction, TransferConfig, TransferEvent,
    TransferStatus, TrustedPeer,
};
pub use dispatcher::{Dispatcher, Handler, Middleware, PendingReply};
pub use error::{ClientError, Result};
pub use link::{DataChannel, LinkError, LinkEvent, LinkFactory, LinkState, PeerLink};
pub use protocol::{ControlMessage, FileOffer, MessageType};
pub use relay::{LocalRelay, Relay, RelayPublisher, RelaySubscription};

/// Size of one data-channel chunk in bytes (16 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Buffered bytes at which a sender pauses (64 KB)
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// Buffered bytes at which a paused sender resumes (32 KB)
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
