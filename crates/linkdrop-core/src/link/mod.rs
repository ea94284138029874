//! Direct peer-link capability.
//!
//! A [`PeerLink`] is one negotiated connection to a remote client. It is
//! established by exchanging opaque descriptors (offer/answer) and address
//! candidates over the relay, then carries any number of named
//! [`DataChannel`]s: reliable, ordered byte channels with a buffered-amount
//! low watermark.
//!
//! Asynchronous happenings on a link (local candidates, state changes,
//! channels opened by the remote side) are reported as [`LinkEvent`]s on the
//! receiver returned by [`LinkFactory::create`].
//!
//! [`loopback`] provides an in-process implementation.

pub mod loopback;

use async_trait::async_trait;
use bytes::Bytes;
use linkdrop_registry::PublicId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::{LoopbackConfig, LoopbackNetwork};

/// Link and channel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Data channel was closed by either side
    #[error("data channel closed")]
    ChannelClosed,

    /// Link is not (yet) connected
    #[error("link not connected")]
    NotConnected,

    /// Link was closed
    #[error("link closed")]
    LinkClosed,

    /// Descriptor or candidate could not be applied
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Result type for link operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Connectivity state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing negotiated
    New,
    /// Descriptors exchanged, address negotiation in progress
    Connecting,
    /// Direct path established
    Connected,
    /// Address negotiation failed; a restart may recover
    Failed,
    /// Closed locally or by the remote side
    Closed,
}

/// Asynchronous link notification
pub enum LinkEvent {
    /// A local address candidate to forward to the remote side
    LocalCandidate(String),
    /// Connectivity changed
    StateChanged(LinkState),
    /// The remote side opened a data channel
    IncomingChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            LinkEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            LinkEvent::IncomingChannel(ch) => {
                f.debug_tuple("IncomingChannel").field(&ch.label()).finish()
            }
        }
    }
}

/// Creates links to remote clients
pub trait LinkFactory: Send + Sync {
    /// Create an unnegotiated link from `local` to `remote`.
    ///
    /// # Errors
    ///
    /// Returns a [`LinkError`] if the underlying stack refuses the link.
    fn create(
        &self,
        local: &PublicId,
        remote: &PublicId,
    ) -> LinkResult<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>)>;
}

/// One negotiated connection to a remote client
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce an offer descriptor; `restart` requests fresh address
    /// negotiation on an existing link.
    async fn create_offer(&self, restart: bool) -> LinkResult<String>;

    /// Apply a remote offer and produce the answer descriptor.
    async fn accept_offer(&self, offer: &str) -> LinkResult<String>;

    /// Apply the remote answer to our offer.
    async fn accept_answer(&self, answer: &str) -> LinkResult<()>;

    /// Apply a remote address candidate.
    async fn add_remote_candidate(&self, candidate: &str) -> LinkResult<()>;

    /// Open a data channel; the remote side sees it as
    /// [`LinkEvent::IncomingChannel`].
    async fn open_channel(&self, label: &str) -> LinkResult<Arc<dyn DataChannel>>;

    /// Current connectivity state
    fn state(&self) -> LinkState;

    /// Close the link and every channel on it.
    async fn close(&self);
}

/// Reliable, ordered byte channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Queue bytes for delivery; they count as buffered until consumed by
    /// the remote side.
    async fn send(&self, data: Bytes) -> LinkResult<()>;

    /// Bytes sent but not yet consumed by the remote side
    fn buffered_amount(&self) -> usize;

    /// Threshold at or below which the low-buffer signal fires
    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Wait until the buffered amount is at or below the low threshold.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel closes first.
    async fn wait_buffered_low(&self) -> LinkResult<()>;

    /// Next chunk from the remote side; `None` once the channel is closed.
    async fn recv(&self) -> Option<Bytes>;

    /// Close the channel for both sides.
    async fn close(&self);

    /// Whether either side closed the channel
    fn is_closed(&self) -> bool;
}
