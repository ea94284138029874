//! Client orchestration layer for linkdrop
//!
//! This module provides the high-level [`Client`] API that coordinates all
//! engine components:
//! - Trust handshakes over link codes (registry + relay)
//! - Authentication of inbound requests (ephemeral tokens, trusted peers)
//! - Peer sessions negotiated over the relay (direct links)
//! - Chunked file transfers with backpressure (files crate)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Client API                           │
//! │  (handshake, offers, requests, trust management)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Trust  │  Sessions  │  Transfers  │  Profile           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Dispatcher  │  Relay  │  Peer links  │  File store     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use linkdrop_core::client::{Client, Collaborators, ClientConfig};
//!
//! # async fn example(alice: Collaborators, bob: Collaborators) -> linkdrop_core::Result<()> {
//! let alice = Client::setup(alice, ClientConfig::default()).await?;
//! let bob = Client::setup(bob, ClientConfig::default()).await?;
//!
//! // Alice hands her code to Bob out of band
//! let code = alice.create_link_code().await?;
//! let peer = bob.connect(code.as_str()).await?;
//! assert_eq!(&peer.public_id, alice.public_id());
//! # Ok(())
//! # }
//! ```

#[allow(clippy::module_inception)]
pub mod client;
pub mod config;
pub mod events;
pub mod handshake;
pub mod profile;
pub mod session;
pub mod transfer;
pub mod trust;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Client, Collaborators};
pub use config::{ClientConfig, DispatchConfig, TransferConfig};
pub use events::{ClientEvent, Direction, TransferEvent, TransferStatus};
pub use handshake::parse_share_path;
pub use profile::{
    ClientProfile, DEFAULT_DISPLAY_NAME, JsonProfileStore, MemoryProfileStore, ProfileStore,
    TrustedPeer,
};
pub use session::{PeerSession, SessionState};
pub use trust::{Authenticator, TokenKind, TrustStore};
