//! Relay abstraction.
//!
//! The relay is a per-client addressable publish/subscribe channel. Clients
//! subscribe under their public id, proving ownership with their private id,
//! and publish messages addressed to other public ids. Delivery is
//! at-least-once and ordered per sender/recipient pair.
//!
//! [`LocalRelay`] is an in-process relay that checks subscriptions against a
//! [`LinkRegistry`] and carries messages as JSON text.

use crate::error::{ClientError, Result};
use crate::protocol::ControlMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use linkdrop_registry::{LinkRegistry, PrivateId, PublicId};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Publish/subscribe relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Subscribe under `public_id`.
    ///
    /// # Errors
    ///
    /// Fails if `private_id` does not own `public_id`.
    async fn subscribe(
        &self,
        public_id: &PublicId,
        private_id: &PrivateId,
    ) -> Result<RelaySubscription>;
}

/// Outbound half of a subscription
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Publish a message to the client named by `message.client_id`.
    ///
    /// The relay replaces `client_id` with the publisher's id before delivery.
    async fn publish(&self, message: ControlMessage) -> Result<()>;

    /// End the subscription; no further messages are delivered.
    async fn close(&self);
}

/// Inbound half of a subscription
pub struct RelayInbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl RelayInbox {
    /// Wrap a stream of raw wire frames
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Next decodable message; `None` once the subscription ended.
    ///
    /// Undecodable frames are logged and skipped.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        loop {
            let raw = self.rx.recv().await?;
            match ControlMessage::from_json(&raw) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Dropping undecodable relay frame: {}", e),
            }
        }
    }
}

/// An authenticated relay subscription
pub struct RelaySubscription {
    /// Send side
    pub publisher: Arc<dyn RelayPublisher>,
    /// Receive side
    pub inbox: RelayInbox,
}

type Mailboxes = Arc<DashMap<PublicId, mpsc::UnboundedSender<String>>>;

/// In-process relay backed by the identity registry
#[derive(Clone)]
pub struct LocalRelay {
    registry: Arc<LinkRegistry>,
    mailboxes: Mailboxes,
}

impl LocalRelay {
    /// Create a relay that authenticates subscribers against `registry`
    pub fn new(registry: Arc<LinkRegistry>) -> Self {
        Self {
            registry,
            mailboxes: Arc::new(DashMap::new()),
        }
    }

    /// Number of live subscriptions
    pub fn subscribers(&self) -> usize {
        self.mailboxes.len()
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn subscribe(
        &self,
        public_id: &PublicId,
        private_id: &PrivateId,
    ) -> Result<RelaySubscription> {
        let identity = self.registry.lookup_by_private_id(private_id).await?;
        if identity.public_id != *public_id {
            tracing::warn!("Rejected relay subscription for {}", public_id.short());
            return Err(ClientError::Relay(Cow::Borrowed(
                "credential does not match subscription id",
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.mailboxes.insert(public_id.clone(), tx).is_some() {
            tracing::debug!("Replaced relay subscription for {}", public_id.short());
        }
        tracing::debug!("Relay subscription for {}", public_id.short());

        Ok(RelaySubscription {
            publisher: Arc::new(LocalPublisher {
                sender: public_id.clone(),
                mailboxes: Arc::clone(&self.mailboxes),
            }),
            inbox: RelayInbox::new(rx),
        })
    }
}

struct LocalPublisher {
    sender: PublicId,
    mailboxes: Mailboxes,
}

#[async_trait]
impl RelayPublisher for LocalPublisher {
    async fn publish(&self, mut message: ControlMessage) -> Result<()> {
        let target = std::mem::replace(&mut message.client_id, self.sender.clone());
        let raw = message.to_json()?;

        match self.mailboxes.get(&target) {
            Some(mailbox) if mailbox.send(raw).is_ok() => {
                tracing::trace!(
                    "Relayed {} {} -> {}",
                    message.kind,
                    self.sender.short(),
                    target.short()
                );
            }
            // Publishing to an absent subscriber is not an error on a pub/sub relay
            _ => tracing::debug!(
                "No subscriber {} for {} from {}",
                target.short(),
                message.kind,
                self.sender.short()
            ),
        }
        Ok(())
    }

    async fn close(&self) {
        self.mailboxes.remove(&self.sender);
    }
}
